//! Decomposition of dataset tokens into a lemma and a part-of-speech tag

/// Part-of-speech placeholder for tokens that carry no tag
pub const UNTAGGED: &str = "_";

/// Token split into a lemma and a part-of-speech tag
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SplitToken<'token> {
    /// Base word form
    pub lemma: &'token str,

    /// Grammatical category, or [`UNTAGGED`]
    pub pos: &'token str,
}

/// Split a token into a lemma and a part-of-speech tag
///
/// - Standalone tags like `_NOUN_` are both their own lemma and tag.
/// - Otherwise, the tag is whatever follows the last underscore, so that
///   `run_VERB` becomes (`run`, `VERB`) and `1,387,805_NUM` becomes
///   (`1,387,805`, `NUM`).
/// - Tokens without an underscore get the [`UNTAGGED`] placeholder tag.
pub fn split_token(token: &str) -> SplitToken<'_> {
    if token.starts_with('_') && token.ends_with('_') {
        return SplitToken {
            lemma: token,
            pos: token,
        };
    }
    match token.rsplit_once('_') {
        Some((lemma, pos)) => SplitToken { lemma, pos },
        None => SplitToken {
            lemma: token,
            pos: UNTAGGED,
        },
    }
}
