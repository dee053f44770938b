use streamgate::media::{BoxError, BoxParser, BoxType};

fn boxed(kind: &[u8; 4], total: usize) -> Vec<u8> {
    let mut out = (total as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.resize(total, kind[0]);
    out
}

fn stream() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend(boxed(b"ftyp", 20));
    data.extend(boxed(b"moov", 150));
    data.extend(boxed(b"moof", 80));
    data.extend(boxed(b"mdat", 500));
    data
}

fn parse_in_chunks(data: &[u8], chunk: usize) -> Vec<(BoxType, usize)> {
    let mut parser = BoxParser::new(1 << 20);
    let mut out = Vec::new();
    for piece in data.chunks(chunk) {
        parser.push(piece);
        for media_box in parser.drain().unwrap() {
            out.push((media_box.box_type, media_box.len()));
        }
    }
    assert_eq!(parser.buffered(), 0);
    out
}

#[test]
fn test_boxes_are_independent_of_chunk_boundaries() {
    let data = stream();
    let expected = vec![
        (BoxType(*b"ftyp"), 20),
        (BoxType(*b"moov"), 150),
        (BoxType(*b"moof"), 80),
        (BoxType(*b"mdat"), 500),
    ];

    for chunk in [1, 3, 7, 8, 64, 1000] {
        assert_eq!(parse_in_chunks(&data, chunk), expected, "chunk size {chunk}");
    }
}

#[test]
fn test_box_bytes_are_exact() {
    let data = stream();
    let mut parser = BoxParser::new(1 << 20);
    parser.push(&data);

    let boxes = parser.drain().unwrap();
    let rejoined: Vec<u8> = boxes.iter().flat_map(|b| b.data.iter().copied()).collect();
    assert_eq!(rejoined, data);
    assert!(boxes[0].box_type.is_init());
    assert!(boxes[1].box_type.is_init());
    assert!(!boxes[2].box_type.is_init());
}

#[test]
fn test_partial_trailing_box_stays_buffered() {
    let mut data = boxed(b"moof", 80);
    data.extend_from_slice(&boxed(b"mdat", 500)[..100]);

    let mut parser = BoxParser::new(1 << 20);
    parser.push(&data);

    let boxes = parser.drain().unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!(parser.buffered(), 100);
}

#[test]
fn test_extended_size_box_split_across_pushes() {
    let mut data = 1u32.to_be_bytes().to_vec();
    data.extend_from_slice(b"mdat");
    data.extend_from_slice(&40u64.to_be_bytes());
    data.resize(40, 9);
    data.extend(boxed(b"moof", 8));

    let parsed = parse_in_chunks(&data, 5);
    assert_eq!(
        parsed,
        vec![(BoxType(*b"mdat"), 40), (BoxType(*b"moof"), 8)]
    );
}

#[test]
fn test_errors_are_sticky() {
    let mut parser = BoxParser::new(1 << 20);
    parser.push(&[0, 0, 0, 3, b'b', b'a', b'd', b'!']);

    let first = parser.next_box();
    assert!(matches!(first, Err(BoxError::InvalidSize { size: 3, .. })));
    parser.push(&boxed(b"moof", 16));
    assert_eq!(parser.next_box(), first);
}

#[test]
fn test_extended_size_smaller_than_header_is_invalid() {
    let mut data = 1u32.to_be_bytes().to_vec();
    data.extend_from_slice(b"mdat");
    data.extend_from_slice(&8u64.to_be_bytes());

    let mut parser = BoxParser::new(1 << 20);
    parser.push(&data);
    assert!(matches!(
        parser.next_box(),
        Err(BoxError::InvalidSize { size: 8, .. })
    ));
}

#[test]
fn test_size_limit_is_enforced_before_buffering_body() {
    let mut parser = BoxParser::new(100);
    parser.push(&boxed(b"mdat", 101)[..8]);

    let err = parser.next_box().unwrap_err();
    assert_eq!(err.to_string(), "box 'mdat' size 101 exceeds limit 100");
}
