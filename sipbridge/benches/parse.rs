use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sipbridge::parser::parse_datagram;
use sipbridge::serializer::serialize;

const INVITE: &[u8] = b"INVITE sip:+12025550101@as.example.net SIP/2.0\r\n\
    Via: SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bK776asdhds\r\n\
    Max-Forwards: 70\r\n\
    To: Bob <sip:+12025550101@as.example.net>\r\n\
    From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
    Call-ID: a84b4c76e66710\r\n\
    CSeq: 314159 INVITE\r\n\
    Contact: <sip:alice@192.0.2.4:5060>\r\n\
    Content-Type: application/sdp\r\n\
    Content-Length: 132\r\n\r\n\
    v=0\r\n\
    o=alice 2890844526 2890844526 IN IP4 192.0.2.4\r\n\
    s=-\r\n\
    c=IN IP4 192.0.2.4\r\n\
    t=0 0\r\n\
    m=audio 49172 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n";

const OPTIONS: &[u8] = b"OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
    Via: SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bKhjhs8ass877\r\n\
    Max-Forwards: 70\r\n\
    To: <sip:carol@chicago.com>\r\n\
    From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
    Call-ID: a84b4c76e66710\r\n\
    CSeq: 63104 OPTIONS\r\n\
    Contact: <sip:alice@192.0.2.4>\r\n\
    Content-Length: 0\r\n\r\n";

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse invite with sdp", |b| {
        b.iter(|| parse_datagram(black_box(INVITE)).unwrap())
    });
    c.bench_function("parse options", |b| {
        b.iter(|| parse_datagram(black_box(OPTIONS)).unwrap())
    });
}

fn bench_serialize(c: &mut Criterion) {
    let parsed = parse_datagram(INVITE).unwrap().unwrap().msg;
    c.bench_function("serialize invite", |b| {
        b.iter_batched(
            || parsed.clone(),
            |mut msg| serialize(black_box(&mut msg)),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_parse, bench_serialize);
criterion_main!(benches);
