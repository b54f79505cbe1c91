use super::events::SessionEvent;
use super::state::{Participant, Role, RoleAssignment, SessionState};
use super::{CallDeps, CallOptions, Command, SessionSnapshot};
use crate::config::CallConfig;
use crate::error::{CallError, ConnectivityError, MediaAcquisitionError, Result};
use crate::logger::analyze_candidates;
use crate::media::{MediaDeviceController, MediaHandle, MediaKind};
use crate::peer::{
    IceCandidate, PeerConnectionManager, PeerConnectionState, PeerConnector, PeerEvent,
    SessionDescription,
};
use crate::signaling::{SignalMessage, SignalingChannel};
use chrono::{DateTime, Utc};
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub(super) struct CallActor {
    config: CallConfig,
    room_id: String,
    role_assignment: RoleAssignment,
    media_kind: MediaKind,
    local: Participant,
    remote: Option<Participant>,
    state: SessionState,

    signaling: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    media: MediaDeviceController,
    peer: Option<Arc<PeerConnectionManager>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    inbox: Option<mpsc::UnboundedReceiver<SignalMessage>>,

    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    duration: Arc<AtomicU64>,
    connected_for: Duration,
    connected_at: Option<DateTime<Utc>>,

    ticker: Option<Interval>,
    grace_deadline: Option<Instant>,
    exit_deadline: Option<Instant>,

    // флаги текущей попытки согласования
    offer_sent: bool,
    answer_sent: bool,
    local_candidates: Vec<IceCandidate>,
    // последний принятый offer, повторная доставка не перезапускает соединение
    remote_offer: Option<String>,

    joined: bool,
    end_received: bool,
    torn_down: bool,
    navigated: bool,
    finished: bool,
    reconnect_attempts: u32,
}

impl CallActor {
    pub(super) fn new(
        config: CallConfig,
        deps: CallDeps,
        options: CallOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<SessionState>,
        duration: Arc<AtomicU64>,
    ) -> Self {
        let fixed_role = match options.role {
            RoleAssignment::Fixed(role) => Some(role),
            RoleAssignment::ByUserId => None,
        };
        // подписка до Join, чтобы не пропустить ответ ретранслятора
        let inbox = deps.signaling.subscribe();
        Self {
            media_kind: options.media_kind.unwrap_or(config.media_kind),
            config,
            room_id: options.room_id,
            role_assignment: options.role,
            local: Participant::new(options.user_id, fixed_role),
            remote: None,
            state: SessionState::Idle,
            signaling: deps.signaling,
            connector: deps.connector,
            media: MediaDeviceController::new(deps.devices),
            peer: None,
            peer_events: None,
            inbox: Some(inbox),
            events,
            state_tx,
            duration,
            connected_for: Duration::ZERO,
            connected_at: None,
            ticker: None,
            grace_deadline: None,
            exit_deadline: None,
            offer_sent: false,
            answer_sent: false,
            local_candidates: Vec::new(),
            remote_offer: None,
            joined: false,
            end_received: false,
            torn_down: false,
            navigated: false,
            finished: false,
            reconnect_attempts: 0,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.start_attempt().await;

        while !self.finished {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("Call handle dropped, ending call");
                        self.end().await;
                    }
                },
                message = recv_opt(&mut self.inbox) => match message {
                    Some(message) => self.on_signal(message).await,
                    None => {
                        warn!("Signaling channel closed for room {}", self.room_id);
                        self.inbox = None;
                    }
                },
                event = recv_opt(&mut self.peer_events) => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => self.peer_events = None,
                },
                _ = tick_opt(&mut self.ticker) => self.on_tick(),
                _ = sleep_opt(self.grace_deadline) => self.on_grace_expired().await,
                _ = sleep_opt(self.exit_deadline) => {
                    self.exit_deadline = None;
                    self.end().await;
                }
            }
        }
        info!("Call session for room {} finished", self.room_id);
    }

    // ---------- состояние ----------

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, next: SessionState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!("Ignoring transition {:?} -> {:?}", from, next);
            return;
        }
        info!("Call state: {:?} -> {:?}", from, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged { from, to: next });
    }

    fn role(&self) -> Option<Role> {
        self.local.role
    }

    /// Запоминает собеседника при первом упоминании. Сообщения от
    /// третьих лиц отбрасываются.
    fn accept_remote(&mut self, user_id: &str) -> bool {
        if let Some(remote) = &self.remote {
            if remote.id != user_id {
                warn!(
                    "Ignoring message from {}: already talking to {}",
                    user_id, remote.id
                );
                return false;
            }
            return true;
        }

        let role = self
            .role_assignment
            .resolve(&self.local.id, user_id);
        self.local.role = Some(role);
        self.remote = Some(Participant::new(user_id, Some(role.opposite())));
        info!("Remote participant {} joined, local role {:?}", user_id, role);
        true
    }

    // ---------- попытка звонка ----------

    /// Захват медиа, соединение и вход в комнату
    async fn start_attempt(&mut self) {
        self.transition(SessionState::AcquiringMedia);
        let handle = match self.media.acquire(self.media_kind).await {
            Ok(handle) => handle,
            Err(e) => return self.fail_media(e),
        };
        self.emit(SessionEvent::LocalMedia(handle.clone()));
        self.transition(SessionState::Joining);

        if let Err(e) = self.open_peer(&handle).await {
            return self.fail_terminal(e).await;
        }

        let join = SignalMessage::Join {
            room_id: self.room_id.clone(),
            user_id: self.local.id.clone(),
        };
        if let Err(e) = self.signaling.send(join).await {
            return self.fail_terminal(e.into()).await;
        }
        self.joined = true;
        self.transition(SessionState::WaitingForPeer);
    }

    async fn open_peer(&mut self, handle: &MediaHandle) -> Result<()> {
        let (peer, events) = PeerConnectionManager::create(self.connector.as_ref(), handle).await?;
        self.peer = Some(Arc::new(peer));
        self.peer_events = Some(events);
        Ok(())
    }

    /// Единственное место, где закрывается соединение
    async fn dispose_peer(&mut self) {
        self.peer_events = None;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(remote) = self.remote.as_mut() {
            remote.connection_state = PeerConnectionState::Closed;
        }
    }

    fn reset_negotiation(&mut self) {
        self.offer_sent = false;
        self.answer_sent = false;
        self.local_candidates.clear();
        self.grace_deadline = None;
        self.ticker = None;
    }

    /// Новое соединение с теми же треками, когда собеседник пришёл заново
    /// или прислал новый offer
    async fn restart_peer(&mut self) -> bool {
        info!("Restarting peer connection in room {}", self.room_id);
        self.dispose_peer().await;
        self.reset_negotiation();
        self.transition(SessionState::WaitingForPeer);

        let handle = match self.media.acquire(self.media_kind).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_media(e);
                return false;
            }
        };
        if let Err(e) = self.open_peer(&handle).await {
            self.fail_terminal(e).await;
            return false;
        }
        true
    }

    // ---------- сигнальные сообщения ----------

    async fn on_signal(&mut self, message: SignalMessage) {
        if self.state.is_terminal() {
            debug!("Dropping {} after call finished", message.event_name());
            return;
        }
        if message.room_id() != self.room_id {
            debug!(
                "Dropping {} for foreign room {}",
                message.event_name(),
                message.room_id()
            );
            return;
        }

        match message {
            SignalMessage::ParticipantJoined { user_id, .. } => {
                self.on_participant_joined(&user_id).await
            }
            SignalMessage::Offer { sdp, from, .. } => self.on_offer(&from, sdp).await,
            SignalMessage::Answer { sdp, from, .. } => self.on_answer(&from, sdp).await,
            SignalMessage::IceCandidate { candidate, .. } => {
                let Some(peer) = self.peer.clone() else {
                    debug!("No peer connection, dropping remote candidate");
                    return;
                };
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("Failed to apply remote ICE candidate: {}", e);
                }
            }
            SignalMessage::End { user_id, .. } => {
                if user_id == self.local.id {
                    return;
                }
                if self.remote.as_ref().is_some_and(|r| r.id != user_id) {
                    warn!("Ignoring endCall from unknown participant {}", user_id);
                    return;
                }
                info!("Remote participant {} ended the call", user_id);
                self.end_received = true;
                self.end().await;
            }
            SignalMessage::Join { .. } => {
                debug!("Ignoring call:join echoed by signaling channel");
            }
        }
    }

    async fn on_participant_joined(&mut self, user_id: &str) {
        if user_id == self.local.id || !self.accept_remote(user_id) {
            return;
        }
        let initiator = self.role() == Some(Role::Initiator);
        match self.state {
            SessionState::WaitingForPeer if initiator && !self.offer_sent => {
                self.send_offer().await
            }
            // собеседник вошёл заново, его прежнее соединение уже закрыто
            SessionState::Connected => {
                if self.restart_peer().await && initiator {
                    self.send_offer().await;
                }
            }
            state => debug!("Participant {} announced again in {:?}", user_id, state),
        }
    }

    async fn on_offer(&mut self, from: &str, sdp: SessionDescription) {
        if from == self.local.id || !self.accept_remote(from) {
            return;
        }
        if self.role() == Some(Role::Initiator) {
            debug!("Ignoring offer from {}: local side initiates", from);
            return;
        }
        match self.state {
            SessionState::WaitingForPeer => self.answer(sdp).await,
            SessionState::Connected if self.remote_offer.as_deref() == Some(sdp.sdp.as_str()) => {
                debug!("Duplicate offer from {}", from);
            }
            SessionState::Connected => {
                if self.restart_peer().await {
                    self.answer(sdp).await;
                }
            }
            state => debug!("Ignoring offer from {} in {:?}", from, state),
        }
    }

    async fn on_answer(&mut self, from: &str, sdp: SessionDescription) {
        if from == self.local.id || !self.accept_remote(from) {
            return;
        }
        if self.role() != Some(Role::Initiator) || self.state != SessionState::Offering {
            debug!("Ignoring answer from {} in {:?}", from, self.state);
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if let Err(e) = peer.set_remote_description(sdp).await {
            warn!("Failed to apply remote answer: {}", e);
            return;
        }
        self.on_negotiated();
    }

    async fn send_offer(&mut self) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if self.offer_sent {
            return;
        }
        self.offer_sent = true;
        self.transition(SessionState::Offering);

        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.fail_terminal(e.into()).await,
        };
        if let Err(e) = peer.set_local_description(offer.clone()).await {
            return self.fail_terminal(e.into()).await;
        }
        let message = SignalMessage::Offer {
            room_id: self.room_id.clone(),
            sdp: offer,
            from: self.local.id.clone(),
        };
        if let Err(e) = self.signaling.send(message).await {
            return self.fail_terminal(e.into()).await;
        }
        info!("Offer sent to room {}", self.room_id);
    }

    async fn answer(&mut self, offer: SessionDescription) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if self.answer_sent || !peer.can_accept_offer() {
            debug!("Connection cannot accept an offer now");
            return;
        }
        let offer_sdp = offer.sdp.clone();
        if let Err(e) = peer.set_remote_description(offer).await {
            warn!("Failed to apply remote offer: {}", e);
            return;
        }
        self.remote_offer = Some(offer_sdp);
        self.transition(SessionState::Answering);

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.fail_terminal(e.into()).await,
        };
        if let Err(e) = peer.set_local_description(answer.clone()).await {
            return self.fail_terminal(e.into()).await;
        }
        let message = SignalMessage::Answer {
            room_id: self.room_id.clone(),
            sdp: answer,
            from: self.local.id.clone(),
        };
        if let Err(e) = self.signaling.send(message).await {
            return self.fail_terminal(e.into()).await;
        }
        self.answer_sent = true;
        info!("Answer sent to room {}", self.room_id);
        self.on_negotiated();
    }

    fn on_negotiated(&mut self) {
        self.transition(SessionState::Connected);
        self.connected_at.get_or_insert_with(Utc::now);
        if self.ticker.is_none() {
            let period = self.config.tick_interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
        }
    }

    fn on_tick(&mut self) {
        self.connected_for += self.config.tick_interval();
        let secs = self.connected_for.as_secs();
        self.duration.store(secs, Ordering::SeqCst);
        self.emit(SessionEvent::DurationTick(secs));
    }

    // ---------- события соединения ----------

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                let message = SignalMessage::IceCandidate {
                    room_id: self.room_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message).await {
                    warn!("Failed to send local ICE candidate: {}", e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                info!("Remote {:?} track {} received", track.kind, track.id);
                self.emit(SessionEvent::RemoteTrack(track));
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(state),
        }
    }

    fn on_connection_state(&mut self, state: PeerConnectionState) {
        info!("Peer connection state: {:?}", state);
        if let Some(remote) = self.remote.as_mut() {
            remote.connection_state = state;
        }
        if self.state.is_terminal() {
            return;
        }
        match state {
            PeerConnectionState::Connected => {
                self.reconnect_attempts = 0;
                if self.grace_deadline.take().is_some() {
                    info!("Peer connection recovered");
                    self.emit(SessionEvent::ConnectionRecovered);
                }
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                if self.grace_deadline.is_some() {
                    return;
                }
                analyze_candidates(&self.local_candidates);
                let grace = self.config.grace_period();
                warn!(
                    "Peer connection {:?}, waiting {}s for recovery",
                    state,
                    grace.as_secs()
                );
                self.emit(SessionEvent::ConnectionProblem);
                self.emit(SessionEvent::ConnectionRecovering);
                self.grace_deadline = Some(Instant::now() + grace);
            }
            _ => {}
        }
    }

    async fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        let current = self
            .peer
            .as_ref()
            .map_or(PeerConnectionState::Closed, |p| p.connection_state());
        if current == PeerConnectionState::Connected {
            return;
        }
        let error = match current {
            PeerConnectionState::Failed => ConnectivityError::Failed,
            PeerConnectionState::Disconnected => ConnectivityError::Disconnected,
            _ => ConnectivityError::IceFailed,
        };

        let max = self.config.max_reconnect_attempts;
        if self.reconnect_attempts >= max {
            error!("Giving up after {} reconnection attempts", self.reconnect_attempts);
            return self.fail_terminal(error.into()).await;
        }

        self.reconnect_attempts += 1;
        warn!(
            "Connection lost ({}), reconnecting {}/{}",
            error, self.reconnect_attempts, max
        );
        self.emit(SessionEvent::Reconnecting {
            attempt: self.reconnect_attempts,
            max_attempts: max,
        });
        self.dispose_peer().await;
        self.reset_negotiation();
        self.start_attempt().await;
        if !self.state.is_terminal() {
            // новая попытка тоже должна уложиться в grace period
            self.grace_deadline = Some(Instant::now() + self.config.grace_period());
        }
    }

    // ---------- команды UI ----------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetMuted(muted, reply) => {
                self.media.set_muted(muted);
                let _ = reply.send(());
            }
            Command::SetVideoEnabled(enabled, reply) => {
                self.media.set_video_enabled(enabled);
                let _ = reply.send(());
            }
            Command::SwitchCamera(reply) => {
                let result = self.switch_camera().await;
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::End(reply) => {
                self.end().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn switch_camera(&mut self) -> Result<MediaHandle> {
        if self.state.is_terminal() {
            return Err(CallError::SessionClosed);
        }
        let result = self.media.switch_facing().await;
        // даже при неудаче старый трек уже остановлен, отправитель
        // должен получить тот, что открыт вместо него
        if let Some(handle) = self.media.current().cloned() {
            if let (Some(video), Some(peer)) = (handle.video.as_ref(), self.peer.clone()) {
                if let Err(e) = peer.replace_video_track(video).await {
                    warn!("Failed to replace outgoing video track: {}", e);
                }
            }
            self.emit(SessionEvent::LocalMedia(handle));
        }
        Ok(result?)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_id: self.room_id.clone(),
            state: self.state,
            local: self.local.clone(),
            remote: self.remote.clone(),
            media: self.media.state(),
            duration_secs: self.connected_for.as_secs(),
            connected_at: self.connected_at,
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    // ---------- завершение ----------

    /// Ошибка захвата медиа: выход с экрана звонка после короткой паузы
    fn fail_media(&mut self, error: MediaAcquisitionError) {
        warn!("Media acquisition failed: {}", error);
        self.transition(SessionState::Failed);
        self.emit(SessionEvent::Error(error.into()));
        self.exit_deadline = Some(Instant::now() + self.config.failure_exit_delay());
    }

    /// Терминальная ошибка: ресурсы освобождаются сразу, UI показывает
    /// ошибку и кнопку завершения
    async fn fail_terminal(&mut self, error: CallError) {
        error!("Call failed: {}", error);
        self.transition(SessionState::Failed);
        self.emit(SessionEvent::Error(error));
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.ticker = None;
        self.grace_deadline = None;
        self.exit_deadline = None;

        if self.joined {
            if !self.end_received {
                let end = SignalMessage::End {
                    room_id: self.room_id.clone(),
                    user_id: self.local.id.clone(),
                };
                if let Err(e) = self.signaling.send(end).await {
                    warn!("Failed to notify peer about call end: {}", e);
                }
            }
            self.signaling.leave(&self.room_id).await;
        }
        self.dispose_peer().await;
        self.media.release();
        self.inbox = None;
        debug!("Call resources released");
    }

    /// Единая точка завершения: повторные вызовы ничего не делают
    async fn end(&mut self) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Ended);
        }
        self.teardown().await;
        if !self.navigated {
            self.navigated = true;
            self.emit(SessionEvent::NavigateAway);
        }
        self.finished = true;
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn tick_opt(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
