use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::types::{CandidateType, IceCandidate};
use tracing::{debug, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Логирование с временными метками (фильтр из SSC_LOG).
/// Повторный вызов безопасен: второй subscriber просто не ставится.
pub fn init() {
    let filter =
        EnvFilter::try_from_env("SSC_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} type={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.candidate_type()
    );
}

/// Сводка по типам кандидатов
pub fn analyze_candidates(candidates: &[IceCandidate]) -> (usize, usize, usize) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        match candidate.candidate_type() {
            Some(CandidateType::Host) => host_count += 1,
            Some(CandidateType::ServerReflexive) => srflx_count += 1,
            Some(CandidateType::Relay) => relay_count += 1,
            _ => {}
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );

    if !candidates.is_empty() && relay_count == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    (host_count, srflx_count, relay_count)
}
