//! Integration coverage for the ChunkStream text round-trip + reuse
//! scenario, driven entirely through the public crate API.

use tunnel_core::chunk_stream::ChunkStream;

async fn loopback_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
    use tokio::net::{TcpListener, TcpStream};
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (connect.unwrap(), accept.unwrap().0)
}

#[tokio::test]
async fn text_round_trip_then_reuse_on_the_same_connection() {
    let (client_side, server_side) = loopback_pair().await;
    let writer = ChunkStream::new("client", [0x11; 16], client_side);
    let reader = ChunkStream::new("server", [0x11; 16], server_side);

    let chunks: [&str; 4] = ["HelloHello\r\n", "Apple1234,\r\n", "Book009,", "550Clock\n\r,"];

    for chunk in chunks {
        writer.write_chunk(chunk.as_bytes()).await.unwrap();
    }
    let writer = writer.create_reuse().await.unwrap();
    assert_eq!(writer.wrote_chunk_count(), 5, "four data chunks plus the terminator");

    let mut reassembled = String::new();
    for _ in 0..chunks.len() {
        let chunk = reader.read_chunk().await.unwrap().unwrap();
        reassembled.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert_eq!(reassembled, chunks.concat());
    assert!(reader.read_chunk().await.unwrap().is_none(), "terminator observed");
    let reader = reader.accept_reuse().await.unwrap();

    for chunk in chunks {
        writer.write_chunk(chunk.as_bytes()).await.unwrap();
    }
    let mut reassembled_again = String::new();
    for _ in 0..chunks.len() {
        let chunk = reader.read_chunk().await.unwrap().unwrap();
        reassembled_again.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert_eq!(reassembled_again, chunks.concat());
}
