use std::future::Future;
use std::pin::Pin;

use anyhow::Context;

use rusty_interceptor_core::CandidateTable;

pub type CandidateFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<CandidateTable>>> + Send + 'a>>;

/// Supplies raw 256-byte tables captured from the client process. Called once
/// per session, right before the recovery window is searched.
pub trait KeySource: Send + Sync {
    fn candidates(&self) -> CandidateFuture<'_>;
}

/// A fixed list of tables known before the session starts.
#[derive(Debug, Clone, Default)]
pub struct StaticKeySource {
    tables: Vec<CandidateTable>,
}

impl StaticKeySource {
    pub fn new(tables: Vec<CandidateTable>) -> Self {
        Self { tables }
    }

    /// One 512-character hex table per line; blank lines and `#` comments are skipped.
    pub fn from_hex_lines(text: &str) -> anyhow::Result<Self> {
        let mut tables = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let table = line
                .parse::<CandidateTable>()
                .with_context(|| format!("key material line {}", idx + 1))?;
            tables.push(table);
        }
        Ok(Self { tables })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl KeySource for StaticKeySource {
    fn candidates(&self) -> CandidateFuture<'_> {
        let tables = self.tables.clone();
        Box::pin(async move { Ok(tables) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_interceptor_core::StreamCipher;

    #[tokio::test]
    async fn hex_lines_skip_comments() {
        let table = StreamCipher::new(b"abc").unwrap().to_string();
        let text = format!("# captured tables\n\n{table}\n  {}  \n", table.to_lowercase());

        let source = StaticKeySource::from_hex_lines(&text).unwrap();
        assert_eq!(source.len(), 2);
        let tables = source.candidates().await.unwrap();
        assert_eq!(tables[0], tables[1]);
    }

    #[test]
    fn bad_line_names_its_number() {
        let err = StaticKeySource::from_hex_lines("\n00ff\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
