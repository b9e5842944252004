//! Chunking for large documents.
//!
//! Texts beyond the chunk budget are split on line boundaries; chunk ids use
//! the form `<parent>_chunk_<n>`. Retrieval dedups by parent id before
//! ranking, so the parent id stays canonical everywhere outside this crate's
//! storage layer.

/// Upper bound on a chunk's size in bytes. Line-bounded, so a single
/// oversized line becomes its own chunk rather than being split mid-line.
pub const MAX_CHUNK_BYTES: usize = 1024;

/// Split `text` into line-bounded chunks of at most [`MAX_CHUNK_BYTES`].
pub fn chunk_text(text: &str) -> Vec<String> {
    if text.len() <= MAX_CHUNK_BYTES {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > MAX_CHUNK_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

/// Id for chunk `n` of `parent`. A single-chunk document keeps the parent id.
pub fn chunk_id(parent: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        parent.to_string()
    } else {
        format!("{parent}_chunk_{index}")
    }
}

/// Canonical parent of a (possibly chunked) point id.
pub fn parent_id(id: &str) -> &str {
    match id.rfind("_chunk_") {
        Some(pos) if id[pos + "_chunk_".len()..].chars().all(|c| c.is_ascii_digit()) => {
            &id[..pos]
        }
        _ => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
        assert_eq!(chunk_id("learning_7", 0, chunks.len()), "learning_7");
    }

    #[test]
    fn long_text_splits_on_line_boundaries() {
        let line = "x".repeat(300);
        let text = format!("{line}\n{line}\n{line}\n{line}\n{line}");
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK_BYTES + 1);
            assert!(chunk.lines().all(|l| l.len() == 300));
        }
    }

    #[test]
    fn chunk_ids_and_parent_roundtrip() {
        assert_eq!(chunk_id("learning_7", 2, 4), "learning_7_chunk_2");
        assert_eq!(parent_id("learning_7_chunk_2"), "learning_7");
        assert_eq!(parent_id("learning_7"), "learning_7");
        // A suffix that merely looks similar is left alone.
        assert_eq!(parent_id("doc_chunk_notanumber"), "doc_chunk_notanumber");
    }
}
