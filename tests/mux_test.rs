//! Multiplexer integration tests: byte ordering across channels, flow
//! control under a stalled reader and clean close semantics.

use rsup::mux::Mux;
use std::sync::Arc;
use std::time::Duration;

async fn mux_pair() -> (Arc<Mux>, Arc<Mux>) {
	let (a, b) = tokio::io::duplex(1 << 16);
	let (ar, aw) = tokio::io::split(a);
	let (br, bw) = tokio::io::split(b);
	let (client, server) = tokio::join!(Mux::connect(ar, aw), Mux::accept(br, bw));
	(client.unwrap(), server.unwrap())
}

/// Both channels established, client ids equal to server ids.
async fn two_channels(client: &Arc<Mux>, server: &Arc<Mux>) -> (u8, u8) {
	let sid0 = server.chan_listen().unwrap();
	let accept = {
		let server = server.clone();
		tokio::spawn(async move { server.chan_accept(sid0).await })
	};
	let id0 = client.chan_open().await.unwrap();
	accept.await.unwrap().unwrap();

	let id1 = client.chan_listen().unwrap();
	let sid1 = server.chan_open().await.unwrap();
	client.chan_accept(id1).await.unwrap();
	assert_eq!(id0, sid0);
	assert_eq!(id1, sid1);
	(id0, id1)
}

async fn read_exactly(mux: &Arc<Mux>, id: u8, len: usize) -> Vec<u8> {
	let mut out = Vec::with_capacity(len);
	let mut buf = [0u8; 4096];
	while out.len() < len {
		let n = mux.chan_read(id, &mut buf).await.unwrap();
		assert!(n > 0, "unexpected channel EOF");
		out.extend_from_slice(&buf[..n]);
	}
	assert_eq!(out.len(), len);
	out
}

#[tokio::test]
async fn test_bytes_arrive_in_order() {
	let (client, server) = mux_pair().await;
	let (id0, id1) = two_channels(&client, &server).await;

	// Interleave writes on both channels.
	let data0: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
	let data1: Vec<u8> = (0..30_000u32).map(|i| (i % 13) as u8).collect();
	let w = {
		let client = client.clone();
		let (d0, d1) = (data0.clone(), data1.clone());
		tokio::spawn(async move {
			for (c0, c1) in d0.chunks(1000).zip(d1.chunks(750)) {
				client.chan_write(id0, c0).await.unwrap();
				client.chan_write(id1, c1).await.unwrap();
			}
		})
	};
	let r0 = {
		let server = server.clone();
		tokio::spawn(async move { read_exactly(&server, id0, 40_000).await })
	};
	let r1 = {
		let server = server.clone();
		tokio::spawn(async move { read_exactly(&server, id1, 30_000).await })
	};
	w.await.unwrap();
	assert_eq!(r0.await.unwrap(), data0);
	assert_eq!(r1.await.unwrap(), data1);

	client.fini().await;
	server.fini().await;
}

#[tokio::test]
async fn test_flow_control_stalls_writer_without_blocking_peer() {
	let (client, server) = mux_pair().await;
	let (id0, id1) = two_channels(&client, &server).await;

	// Channel 0 has 100 KiB to send but its peer does not read yet;
	// the writer must stall after the send buffer and the advertised
	// window fill up.
	let big: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
	let writer = {
		let client = client.clone();
		let big = big.clone();
		tokio::spawn(async move {
			client.chan_write(id0, &big).await.unwrap();
		})
	};

	// A short exchange on channel 1 completes unimpeded.
	client.chan_write(id1, &[7u8; 4096]).await.unwrap();
	let echoed = read_exactly(&server, id1, 4096).await;
	assert_eq!(echoed, vec![7u8; 4096]);
	server.chan_write(id1, b"done").await.unwrap();
	assert_eq!(read_exactly(&client, id1, 4).await, b"done");

	// The bulk writer is still blocked: nothing on channel 0 has been
	// consumed, so at most a buffer plus a window of credit is gone.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!writer.is_finished(), "writer should be flow-control blocked");

	// Draining channel 0 releases it and every byte arrives in order.
	let got = read_exactly(&server, id0, 100_000).await;
	assert_eq!(got, big);
	writer.await.unwrap();

	client.fini().await;
	server.fini().await;
}

#[tokio::test]
async fn test_clean_close_yields_eof_after_data() {
	let (client, server) = mux_pair().await;
	let (id0, _id1) = two_channels(&client, &server).await;

	client.chan_write(id0, b"tail").await.unwrap();
	client.chan_close(id0).unwrap();

	assert_eq!(read_exactly(&server, id0, 4).await, b"tail");
	let mut buf = [0u8; 16];
	assert_eq!(server.chan_read(id0, &mut buf).await.unwrap(), 0);

	// Closing the other half completes the handshake on both sides.
	server.chan_close(id0).unwrap();
	client.chan_wait(id0).await;

	client.fini().await;
	server.fini().await;
}

#[tokio::test]
async fn test_write_after_close_is_an_error() {
	let (client, server) = mux_pair().await;
	let (id0, _id1) = two_channels(&client, &server).await;

	client.chan_close(id0).unwrap();
	let err = client.chan_write(id0, b"x").await.unwrap_err();
	assert_eq!(err.raw_os_error(), Some(libc::EPIPE));

	client.fini().await;
	server.fini().await;
}
