use rand::Rng;

use super::store::InMemoryStore;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SUFFIX_LEN: usize = 8;
const PREFIX: &str = "BK";

/// `BK-<year>-<8 uppercase alphanumerics>`.
pub fn random_reference(year: i32) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{PREFIX}-{year}-{suffix}")
}

pub fn is_well_formed(reference: &str) -> bool {
    let mut parts = reference.splitn(3, '-');
    let (Some(prefix), Some(year), Some(suffix)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    prefix == PREFIX
        && year.len() == 4
        && year.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == SUFFIX_LEN
        && suffix.bytes().all(|b| ALPHABET.contains(&b))
}

/// Generate candidates until one can be reserved in the store.
///
/// The reservation is atomic, so two concurrent callers can never walk away
/// with the same reference.
pub(crate) fn reserve_unique(
    store: &InMemoryStore,
    year: i32,
    mut generate: impl FnMut(i32) -> String,
) -> String {
    let mut attempts = 1u32;
    loop {
        let candidate = generate(year);
        if store.reserve_reference(&candidate) {
            if attempts > 1 {
                tracing::debug!(attempts, reference = %candidate, "booking reference collision resolved");
            }
            return candidate;
        }
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_references_are_well_formed() {
        for _ in 0..100 {
            let r = random_reference(2026);
            assert!(r.starts_with("BK-2026-"), "{r}");
            assert!(is_well_formed(&r), "{r}");
            assert!(r.len() <= 20);
        }
        assert!(!is_well_formed("BK-26-ABCDEFGH"));
        assert!(!is_well_formed("BK-2026-abcdefgh"));
        assert!(!is_well_formed("XX-2026-ABCDEFGH"));
    }

    #[test]
    fn reservation_retries_until_unused() {
        let store = InMemoryStore::new();
        assert!(store.reserve_reference("BK-2026-AAAAAAAA"));
        assert!(store.reserve_reference("BK-2026-BBBBBBBB"));

        let mut queue = vec!["BK-2026-CCCCCCCC", "BK-2026-BBBBBBBB", "BK-2026-AAAAAAAA"];
        let mut calls = 0;
        let got = reserve_unique(&store, 2026, |_| {
            calls += 1;
            queue.pop().map(String::from).unwrap_or_default()
        });
        assert_eq!(got, "BK-2026-CCCCCCCC");
        assert_eq!(calls, 3);
        assert!(store.has_reference("BK-2026-CCCCCCCC"));
    }

    #[test]
    fn released_reservation_can_be_reused() {
        let store = InMemoryStore::new();
        let r = reserve_unique(&store, 2026, random_reference);
        store.release_reference(&r);
        assert!(!store.has_reference(&r));
        assert!(store.reserve_reference(&r));
    }
}
