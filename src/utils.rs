use crate::config::IceServerKind;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(kind: IceServerKind, url: &str) -> String {
    if url.starts_with("turn:") || url.starts_with("turns:") || url.starts_with("stun:") {
        url.to_string()
    } else {
        let scheme = match kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_existing_scheme() {
        assert_eq!(
            add_ice_url_scheme(IceServerKind::Turn, "stun:a.example:3478"),
            "stun:a.example:3478"
        );
        assert_eq!(
            add_ice_url_scheme(IceServerKind::Turn, "a.example:3478"),
            "turn:a.example:3478"
        );
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
