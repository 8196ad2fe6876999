use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use super::sample::MetricSample;
use super::IngestError;

/// Reads newline-delimited JSON samples.
///
/// Blank lines are skipped. A malformed line yields an error carrying its
/// line number; the reader can keep going after it.
pub struct SampleReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin> SampleReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }

    /// Next sample, or `None` at end of input
    pub async fn next_sample(&mut self) -> Option<Result<MetricSample, IngestError>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(IngestError::Io(e.to_string()))),
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Some(serde_json::from_str(line).map_err(|e| IngestError::Parse {
                line: self.line_no,
                reason: e.to_string(),
            }));
        }
    }

    /// Lines consumed so far
    pub fn line_no(&self) -> usize {
        self.line_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_reads_samples_and_reports_bad_lines() {
        let input = b"{\"metric_key\":\"cpu\",\"value\":1}\n\n not json\n{\"metric_key\":\"cpu\",\"value\":2}\n";
        let mut reader = SampleReader::new(BufReader::new(&input[..]));

        assert_eq!(reader.next_sample().await.unwrap().unwrap().value, 1.0);
        match reader.next_sample().await.unwrap() {
            Err(IngestError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.next_sample().await.unwrap().unwrap().value, 2.0);
        assert!(reader.next_sample().await.is_none());
        assert_eq!(reader.line_no(), 4);
    }

    #[tokio::test]
    async fn test_unreadable_input_is_fatal() {
        let input = b"{\"metric_key\":\"cpu\",\"value\":1}\n\xff\xfe\n";
        let mut reader = SampleReader::new(BufReader::new(&input[..]));

        assert!(reader.next_sample().await.unwrap().is_ok());
        let err = reader.next_sample().await.unwrap().unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
        assert!(err.is_fatal());

        let parse = IngestError::Parse {
            line: 1,
            reason: "bad".to_string(),
        };
        assert!(!parse.is_fatal());
    }
}
