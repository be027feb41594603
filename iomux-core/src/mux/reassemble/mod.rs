use std::{collections::HashMap, hash::Hash};

use crate::TaggedData;

/// Rebuild lines split apart by a byte stream transport.
///
/// A stream read can stop in the middle of a write, letting another tag's
/// chunk slip in between the two halves. Walking the session in order, a
/// chunk is held back in a per-tag buffer until a chunk of the same tag ends
/// in a newline, or until the last chunk of that tag, and is then emitted in
/// one piece at that position.
///
/// Bytes are never lost or reordered within a tag. Payloads without trailing
/// newlines only flush at the last chunk of their tag.
pub(crate) fn lines<T: Clone + Eq + Hash>(
    session: Vec<TaggedData<T>>,
    tags: usize,
) -> Vec<TaggedData<T>> {
    let mut last = HashMap::new();
    for (i, chunk) in session.iter().enumerate().rev() {
        last.entry(chunk.tag.clone()).or_insert(i);
        if last.len() == tags {
            break;
        }
    }

    let mut pending: HashMap<T, Vec<u8>> = HashMap::new();
    let mut lines = Vec::with_capacity(session.len());
    for (i, chunk) in session.into_iter().enumerate() {
        let is_last = last.get(&chunk.tag) == Some(&i);
        if is_last || chunk.data.last() == Some(&b'\n') {
            let mut data = pending.remove(&chunk.tag).unwrap_or_default();
            data.extend_from_slice(&chunk.data);
            lines.push(TaggedData {
                tag: chunk.tag,
                data,
            });
        } else {
            pending
                .entry(chunk.tag)
                .or_default()
                .extend_from_slice(&chunk.data);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: &'static str, data: &[u8]) -> TaggedData<&'static str> {
        TaggedData {
            tag,
            data: data.to_vec(),
        }
    }

    #[test]
    fn split_line_is_rejoined_after_the_interleaved_tag() {
        let session = vec![chunk("a", b"hel"), chunk("b", b"err\n"), chunk("a", b"lo\n")];
        assert_eq!(
            lines(session, 2),
            vec![chunk("b", b"err\n"), chunk("a", b"hello\n")]
        );
    }

    #[test]
    fn complete_lines_keep_their_order() {
        let session = vec![chunk("a", b"out1\n"), chunk("b", b"err1\n"), chunk("a", b"out2\n")];
        assert_eq!(lines(session.clone(), 2), session);
    }

    #[test]
    fn pending_fragments_flush_on_a_newline() {
        let session = vec![
            chunk("a", b"one "),
            chunk("a", b"two\n"),
            chunk("b", b"x"),
            chunk("a", b"three\n"),
        ];
        assert_eq!(
            lines(session, 2),
            vec![chunk("a", b"one two\n"), chunk("b", b"x"), chunk("a", b"three\n")]
        );
    }

    #[test]
    fn binary_payloads_flush_at_the_last_chunk_of_their_tag() {
        let session = vec![chunk("a", &[0; 256]), chunk("b", &[0; 10]), chunk("a", &[0; 20])];
        let result = lines(session, 2);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], chunk("b", &[0; 10]));
        assert_eq!(result[1].tag, "a");
        assert_eq!(result[1].data.len(), 276);
    }

    #[test]
    fn no_bytes_are_lost_per_tag() {
        let session = vec![
            chunk("a", b"1"),
            chunk("b", b"2"),
            chunk("c", b"3\n"),
            chunk("a", b"4\n"),
            chunk("b", b"5"),
            chunk("a", b"6"),
        ];
        let result = lines(session, 3);
        let joined = |tag| -> Vec<u8> {
            result
                .iter()
                .filter(|c| c.tag == tag)
                .flat_map(|c| c.data.clone())
                .collect()
        };
        assert_eq!(joined("a"), b"14\n6");
        assert_eq!(joined("b"), b"25");
        assert_eq!(joined("c"), b"3\n");
    }

    #[test]
    fn empty_session() {
        assert!(lines(Vec::<TaggedData<u8>>::new(), 2).is_empty());
    }
}
