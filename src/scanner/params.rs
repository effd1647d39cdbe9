//! Hidden-parameter probe material

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Candidate parameter names probed against every scan target
pub const PARAM_WORDLIST: &[&str] = &[
    "debug", "test", "admin", "source", "show", "id", "page", "view", "edit", "preview", "token",
    "redirect", "url", "callback", "lang", "order", "sort", "filter", "limit", "offset",
];

/// A 10-character alphanumeric probe value
///
/// Long enough that a verbatim reflection in a response body is not a
/// coincidence.
pub fn random_value() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}
