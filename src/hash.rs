use rand::distributions::Alphanumeric;
use rand::Rng;

pub const HASH_LEN: usize = 32;

/// Generate a candidate tracking handle. Uniqueness is enforced by the
/// database constraint; callers retry on a unique violation rather than
/// trusting an existence check (see intercept::create_tracker).
pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HASH_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_alphanumeric_and_fixed_length() {
        for _ in 0..100 {
            let hash = generate();
            assert_eq!(hash.len(), HASH_LEN);
            assert!(hash.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn hashes_are_not_repeated_in_practice() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }
}
