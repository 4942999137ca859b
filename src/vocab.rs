//! SentencePiece vocabulary loading.

use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum VocabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vocabulary file is empty: {0}")]
    Empty(String),
}

/// Token table for CTC decoding.
///
/// Loaded from a `tokens.txt` file with one token per line, token id equal to
/// the line number. The CTC blank is not listed; its id is one past the last
/// real token (1024 for the canonical 1024-piece SentencePiece set).
pub struct Vocabulary {
    tokens: Vec<String>,
    blank_id: usize,
}

impl Vocabulary {
    /// Load tokens with the blank id defaulting to the token count.
    pub fn load(path: &Path) -> Result<Self, VocabError> {
        let contents = fs::read_to_string(path)?;

        let mut tokens = Vec::new();
        for line in contents.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            // Some token dumps carry "token<TAB>id"; the token is before the tab
            let token = match line.find('\t') {
                Some(pos) => &line[..pos],
                None => line,
            };
            tokens.push(token.to_string());
        }

        if tokens.is_empty() {
            return Err(VocabError::Empty(path.display().to_string()));
        }

        let blank_id = tokens.len();
        log::info!(
            "Loaded {} tokens from {:?}, blank_id={}",
            tokens.len(),
            path,
            blank_id
        );

        Ok(Self { tokens, blank_id })
    }

    /// Load tokens with an explicit blank id.
    pub fn load_with_blank(path: &Path, blank_id: usize) -> Result<Self, VocabError> {
        let mut vocab = Self::load(path)?;
        vocab.blank_id = blank_id;
        Ok(vocab)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn blank_id(&self) -> usize {
        self.blank_id
    }

    #[cfg(test)]
    pub(crate) fn from_tokens(tokens: Vec<&str>) -> Self {
        let blank_id = tokens.len();
        Self {
            tokens: tokens.into_iter().map(String::from).collect(),
            blank_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_tokens_by_line_order() {
        let dir = std::env::temp_dir().join("vocab_load_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.txt");
        std::fs::write(&path, "\u{2581}the\nand\ning\n").unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.token(0), Some("\u{2581}the"));
        assert_eq!(vocab.token(2), Some("ing"));
        assert_eq!(vocab.token(3), None);
        assert_eq!(vocab.blank_id(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_tab_suffix_stripped() {
        let dir = std::env::temp_dir().join("vocab_tab_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.txt");
        std::fs::write(&path, "hello\t0\nworld\t1\n").unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.token(0), Some("hello"));
        assert_eq!(vocab.token(1), Some("world"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = std::env::temp_dir().join("vocab_empty_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.txt");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(Vocabulary::load(&path), Err(VocabError::Empty(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_explicit_blank_override() {
        let dir = std::env::temp_dir().join("vocab_blank_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.txt");
        std::fs::write(&path, "a\nb\n").unwrap();

        let vocab = Vocabulary::load_with_blank(&path, 1024).unwrap();
        assert_eq!(vocab.blank_id(), 1024);

        std::fs::remove_dir_all(&dir).ok();
    }
}
