//! Thread grouping by normalized subject.

use sha2::{Digest, Sha256};

use super::ThreadId;

/// Reply and forward markers stripped from the front of a subject.
///
/// Matched case-insensitively. `fw:` covers both `Fw:` and `Fwd:` spellings
/// once `fwd:` has been tried first.
const REPLY_PREFIXES: [&str; 5] = ["re:", "fwd:", "fw:", "aw:", "sv:"];

/// Length of the hex digest kept in a thread identifier.
const THREAD_DIGEST_LEN: usize = 16;

/// Strips any number of leading reply/forward markers and surrounding whitespace.
///
/// `"Re: Fwd:  Budget"` and `"budget"` are different subjects (case of the
/// remainder is preserved), but `"RE: Budget"` and `"Fwd: Budget"` both
/// normalize to `"Budget"`.
#[must_use]
pub fn normalize_subject(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let stripped = REPLY_PREFIXES.iter().find_map(|prefix| {
            rest.get(..prefix.len())
                .filter(|head| head.eq_ignore_ascii_case(prefix))
                .map(|_| rest[prefix.len()..].trim_start())
        });
        match stripped {
            Some(next) => rest = next,
            None => return rest.trim_end(),
        }
    }
}

/// Derives the thread identifier for a subject.
///
/// Deterministic: equal normalized subjects always give equal identifiers.
#[must_use]
pub fn thread_id_for_subject(subject: &str) -> ThreadId {
    let digest = Sha256::digest(normalize_subject(subject).as_bytes());
    let hex: String = digest
        .iter()
        .take(THREAD_DIGEST_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    ThreadId(format!("thread_{hex}"))
}
