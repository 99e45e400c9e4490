//! Executors backing declarative workflow nodes

pub mod shell;

pub use shell::ShellExecutor;

/// Truncate byte output to `limit` bytes
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8], limit: usize) -> (String, bool) {
    let truncated = data.len() > limit;
    let bytes = if truncated { &data[..limit] } else { data };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output() {
        let (output, truncated) = truncate_output_bytes(b"hello", 10);
        assert_eq!(output, "hello");
        assert!(!truncated);

        let large_data = vec![b'x'; 1_000];
        let (output, truncated) = truncate_output_bytes(&large_data, 100);
        assert_eq!(output.len(), 100);
        assert!(truncated);
    }
}
