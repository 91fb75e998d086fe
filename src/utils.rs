use rand::Rng;

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    rng.fill(&mut peer_id);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_peer_id_is_20_bytes() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn generate_peer_id_is_not_deterministic() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
