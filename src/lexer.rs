//! Lexical analysis of a single pipeline segment.
//!
//! Words are separated by spaces and tabs. There is no quoting: a redirection
//! operator is recognised only when it forms a whole word on its own, so `>out`
//! stays an ordinary word.

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Any word that is not an operator. Borrowed from the input segment.
    Word(&'a str),
    /// Input redirection symbol, `<`.
    RedirectLeft,
    /// Output redirection symbol, `>`.
    RedirectRight,
    /// Appending output redirection symbol, `>>`.
    RedirectAppend,
}

fn is_separator(ch: char) -> bool {
    ch == ' ' || ch == '\t'
}

/// Split one `|`-delimited segment into tokens.
pub fn split_into_tokens(segment: &str) -> Vec<Token<'_>> {
    segment
        .split(is_separator)
        .filter(|word| !word.is_empty())
        .map(|word| match word {
            "<" => Token::RedirectLeft,
            ">" => Token::RedirectRight,
            ">>" => Token::RedirectAppend,
            other => Token::Word(other),
        })
        .collect()
}
