//! Framing properties over arbitrary bodies and arbitrary read boundaries.

use proptest::prelude::*;

use intercepting_proxy::http::{pipeline, BodyBytesKind, ParseListener, ParserLimits, Request};

#[derive(Default)]
struct Collect {
    raw: Vec<u8>,
    content: Vec<u8>,
    ended: usize,
}

impl ParseListener<Request> for Collect {
    fn on_headers(&mut self, _request: &mut Request) {}

    fn on_body(&mut self, _request: &Request, kind: BodyBytesKind, bytes: &[u8]) {
        match kind {
            BodyBytesKind::Raw => self.raw.extend_from_slice(bytes),
            BodyBytesKind::Content => self.content.extend_from_slice(bytes),
        }
    }

    fn on_ended(&mut self, _request: &Request) {
        self.ended += 1;
    }

    fn on_passthrough(&mut self, _bytes: &[u8]) {}
}

/// Feed `wire` to a fresh request parser, cut at `cuts` (taken modulo the length).
fn parse_in_pieces(wire: &[u8], cuts: &[usize]) -> Collect {
    let (mut parser, _responses) = pipeline(ParserLimits::default());
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (wire.len() + 1)).collect();
    points.push(0);
    points.push(wire.len());
    points.sort_unstable();
    points.dedup();

    let mut events = Collect::default();
    for pair in points.windows(2) {
        parser.feed(&wire[pair[0]..pair[1]], &mut events).unwrap();
    }
    parser.finish(&mut events).unwrap();
    events
}

fn chunked_body(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for chunk in chunks {
        body.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\n\r\n");
    body
}

proptest! {
    #[test]
    fn fixed_body_content_matches_declared_length(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut wire = format!(
            "POST /f HTTP/1.1\r\nHost: h\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(&body);

        let events = parse_in_pieces(&wire, &cuts);
        prop_assert_eq!(events.ended, 1);
        prop_assert_eq!(&events.content, &body);
        prop_assert_eq!(&events.raw, &body);
    }

    #[test]
    fn chunked_raw_stream_is_reproduced_from_content(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 0..6),
        cuts in proptest::collection::vec(any::<usize>(), 0..12),
    ) {
        let body = chunked_body(&chunks);
        let mut wire = b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        wire.extend_from_slice(&body);

        let events = parse_in_pieces(&wire, &cuts);
        prop_assert_eq!(events.ended, 1);
        prop_assert_eq!(&events.content, &chunks.concat());
        prop_assert_eq!(&events.raw, &body);
    }
}
