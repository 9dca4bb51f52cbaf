//! Stream multiplexer: one TCP connection carrying several reliable,
//! flow-controlled, in-order byte channels.
//!
//! Two background tasks service the socket.  The sender scans the
//! channels for pending work (handshake frames, window updates, data,
//! close frames) in a fixed priority order and writes one frame per
//! turn; the receiver dispatches incoming frames into per-channel
//! receive rings.  Flow control is window based: each side advertises
//! `recvseq + capacity` and never sends past the peer's advertised
//! window.  All multi-byte header fields are big-endian.
//!
//! Teardown never cancels a task mid-I/O: on error or shutdown both
//! tasks observe a watch signal, every channel is forced to Closed and
//! all waiters are woken.

use crate::error::MuxError;
use crate::logging::*;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub type ChanId = u8;

/// Packet types.
const MUX_STARTUPREQ: u8 = 0;
const MUX_STARTUPREP: u8 = 1;
const MUX_CONNECT: u8 = 2;
const MUX_ACCEPT: u8 = 3;
const MUX_RESET: u8 = 4;
const MUX_DATA: u8 = 5;
const MUX_WINDOW: u8 = 6;
const MUX_CLOSE: u8 = 7;

const MUX_PROTOVER: u16 = 0;

const MUX_MAXCHAN: usize = 2;

/// Channel flags, in sender priority order.
const CF_CONNECT: u32 = 0x01;
const CF_ACCEPT: u32 = 0x02;
const CF_RESET: u32 = 0x04;
const CF_WINDOW: u32 = 0x08;
const CF_DATA: u32 = 0x10;
const CF_CLOSE: u32 = 0x20;

const CHAN_SBSIZE: usize = 16 * 1024;
const CHAN_RBSIZE: usize = 16 * 1024;
const CHAN_MAXSEGSIZE: u16 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChanState {
	Unused,
	Listening,
	Connecting,
	Established,
	RdClosed,
	WrClosed,
	Closed,
}

/// Circular buffer with one spare byte, so in == out means empty.
#[derive(Debug)]
struct Buf {
	data: Vec<u8>,
	size: usize,
	inpos: usize,
	outpos: usize,
}

impl Buf {
	fn new(size: usize) -> Buf {
		Buf { data: vec![0; size + 1], size, inpos: 0, outpos: 0 }
	}

	fn count(&self) -> usize {
		if self.inpos >= self.outpos {
			self.inpos - self.outpos
		} else {
			self.size + 1 + self.inpos - self.outpos
		}
	}

	fn avail(&self) -> usize {
		if self.outpos > self.inpos {
			self.outpos - self.inpos - 1
		} else {
			self.size + self.outpos - self.inpos
		}
	}

	fn put(&mut self, data: &[u8]) {
		assert!(self.avail() >= data.len());
		let len = self.size + 1 - self.inpos;
		if len < data.len() {
			// Wrapping around.
			self.data[self.inpos..].copy_from_slice(&data[..len]);
			self.data[..data.len() - len].copy_from_slice(&data[len..]);
		} else {
			self.data[self.inpos..self.inpos + data.len()].copy_from_slice(data);
		}
		self.inpos += data.len();
		if self.inpos > self.size {
			self.inpos -= self.size + 1;
		}
	}

	fn get(&mut self, dst: &mut [u8]) {
		assert!(self.count() >= dst.len());
		self.peek_into(dst);
		self.consume(dst.len());
	}

	fn peek_into(&self, dst: &mut [u8]) {
		let len = self.size + 1 - self.outpos;
		if len < dst.len() {
			// Wrapping around.
			let dst_len = dst.len();
			dst[..len].copy_from_slice(&self.data[self.outpos..]);
			dst[len..].copy_from_slice(&self.data[..dst_len - len]);
		} else {
			dst.copy_from_slice(&self.data[self.outpos..self.outpos + dst.len()]);
		}
	}

	fn consume(&mut self, n: usize) {
		self.outpos += n;
		if self.outpos > self.size {
			self.outpos -= self.size + 1;
		}
	}
}

#[derive(Debug)]
struct ChanInner {
	state: ChanState,
	flags: u32,

	/// Receiver state.
	recvbuf: Buf,
	recvseq: u32,
	recvmss: u16,

	/// Sender state.
	sendbuf: Buf,
	sendseq: u32,
	sendwin: u32,
	sendmss: u16,
}

struct Chan {
	inner: Mutex<ChanInner>,
	rd: Notify,
	wr: Notify,
}

impl Chan {
	fn new() -> Chan {
		Chan {
			inner: Mutex::new(ChanInner {
				state: ChanState::Unused,
				flags: 0,
				recvbuf: Buf::new(CHAN_RBSIZE),
				recvseq: 0,
				recvmss: CHAN_MAXSEGSIZE,
				sendbuf: Buf::new(CHAN_SBSIZE),
				sendseq: 0,
				sendwin: 0,
				sendmss: 0,
			}),
			rd: Notify::new(),
			wr: Notify::new(),
		}
	}
}

struct MuxInner {
	chans: [Option<Arc<Chan>>; MUX_MAXCHAN],
}

/// The multiplexer.  Channel operations take the channel ID, like a
/// file descriptor.
pub struct Mux {
	inner: Mutex<MuxInner>,
	newwork: Notify,
	shutdown_tx: watch::Sender<bool>,
	closed: AtomicBool,
	error: Mutex<Option<MuxError>>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Mux {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Mux").finish()
	}
}

enum RxStop {
	Shutdown,
	Io(io::Error),
}

impl Mux {
	/// Initiate the multiplexer protocol on a connected socket: send
	/// the startup request, check the reply and start the sender and
	/// receiver tasks.
	pub async fn connect<R, W>(mut rd: R, mut wr: W) -> io::Result<Arc<Mux>>
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let mut hdr = [MUX_STARTUPREQ, 0, 0];
		hdr[1..3].copy_from_slice(&MUX_PROTOVER.to_be_bytes());
		wr.write_all(&hdr).await?;
		wr.flush().await?;
		let mut rep = [0u8; 3];
		rd.read_exact(&mut rep).await?;
		if rep[0] != MUX_STARTUPREP || u16::from_be_bytes([rep[1], rep[2]]) != MUX_PROTOVER {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "bad startup reply"));
		}
		Ok(Mux::start(rd, wr))
	}

	/// Accept the multiplexer protocol from the peer: wait for the
	/// startup request, reply and start the background tasks.  The peer
	/// side of `connect`.
	pub async fn accept<R, W>(mut rd: R, mut wr: W) -> io::Result<Arc<Mux>>
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let mut req = [0u8; 3];
		rd.read_exact(&mut req).await?;
		if req[0] != MUX_STARTUPREQ || u16::from_be_bytes([req[1], req[2]]) != MUX_PROTOVER {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "bad startup request"));
		}
		let mut hdr = [MUX_STARTUPREP, 0, 0];
		hdr[1..3].copy_from_slice(&MUX_PROTOVER.to_be_bytes());
		wr.write_all(&hdr).await?;
		wr.flush().await?;
		Ok(Mux::start(rd, wr))
	}

	fn start<R, W>(rd: R, wr: W) -> Arc<Mux>
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let mux = Arc::new(Mux {
			inner: Mutex::new(MuxInner { chans: [None, None] }),
			newwork: Notify::new(),
			shutdown_tx,
			closed: AtomicBool::new(false),
			error: Mutex::new(None),
			handles: Mutex::new(Vec::new()),
		});
		let sender = tokio::spawn(sender_loop(mux.clone(), wr, shutdown_rx.clone()));
		let receiver = tokio::spawn(receiver_loop(mux.clone(), rd, shutdown_rx));
		{
			let mut handles = mux.handles.lock().unwrap();
			handles.push(sender);
			handles.push(receiver);
		}
		mux
	}

	/// Terminate the background tasks and wait for them.  Safe to call
	/// after an error shutdown as well.
	pub async fn fini(&self) {
		self.shutdown(None, None);
		let handles = std::mem::take(&mut *self.handles.lock().unwrap());
		for handle in handles {
			let _ = handle.await;
		}
	}

	/// The error that shut the multiplexer down, if any.
	pub fn take_error(&self) -> Option<MuxError> {
		self.error.lock().unwrap().take()
	}

	fn chan_get(&self, id: ChanId) -> Option<Arc<Chan>> {
		let inner = self.inner.lock().unwrap();
		inner.chans.get(id as usize).and_then(|c| c.clone())
	}

	fn chan_insert(&self) -> Option<(ChanId, Arc<Chan>)> {
		let mut inner = self.inner.lock().unwrap();
		for (i, slot) in inner.chans.iter_mut().enumerate() {
			if slot.is_none() {
				let chan = Arc::new(Chan::new());
				*slot = Some(chan.clone());
				return Some((i as ChanId, chan));
			}
		}
		None
	}

	/// Create a new channel, connect it and return its ID.
	pub async fn chan_open(&self) -> io::Result<ChanId> {
		let (id, chan) = self
			.chan_insert()
			.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no free channel"))?;
		{
			let mut st = chan.inner.lock().unwrap();
			st.state = ChanState::Connecting;
			st.flags |= CF_CONNECT;
		}
		self.sender_wakeup();
		loop {
			let notified = chan.wr.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let st = chan.inner.lock().unwrap();
				match st.state {
					ChanState::Connecting => {}
					ChanState::Established => return Ok(id),
					_ => {
						return Err(io::Error::new(
							io::ErrorKind::ConnectionRefused,
							"channel connect failed",
						))
					}
				}
			}
			notified.await;
		}
	}

	/// Reserve a channel in the listening state and return its ID.
	pub fn chan_listen(&self) -> io::Result<ChanId> {
		{
			let inner = self.inner.lock().unwrap();
			for (i, slot) in inner.chans.iter().enumerate() {
				if let Some(chan) = slot {
					let mut st = chan.inner.lock().unwrap();
					if st.state == ChanState::Unused {
						st.state = ChanState::Listening;
						return Ok(i as ChanId);
					}
				}
			}
		}
		let (id, chan) = self
			.chan_insert()
			.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no free channel"))?;
		chan.inner.lock().unwrap().state = ChanState::Listening;
		Ok(id)
	}

	/// Wait for an incoming connect on a listening channel.
	pub async fn chan_accept(&self, id: ChanId) -> io::Result<()> {
		let chan = self
			.chan_get(id)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
		loop {
			let notified = chan.rd.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let st = chan.inner.lock().unwrap();
				match st.state {
					ChanState::Listening => {}
					ChanState::Established => return Ok(()),
					_ => {
						return Err(io::Error::new(
							io::ErrorKind::ConnectionReset,
							"channel accept failed",
						))
					}
				}
			}
			notified.await;
		}
	}

	/// Read bytes from a channel.  Returns 0 on a clean close of the
	/// read side.
	pub async fn chan_read(&self, id: ChanId, buf: &mut [u8]) -> io::Result<usize> {
		let chan = self
			.chan_get(id)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
		if buf.is_empty() {
			return Ok(0);
		}
		let n = loop {
			let notified = chan.rd.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let mut st = chan.inner.lock().unwrap();
				match st.state {
					ChanState::RdClosed | ChanState::Closed => {
						let count = st.recvbuf.count();
						if count == 0 {
							return Ok(0);
						}
						// Drain what the peer sent before closing.
						let n = count.min(buf.len());
						st.recvbuf.get(&mut buf[..n]);
						st.recvseq = st.recvseq.wrapping_add(n as u32);
						break n;
					}
					ChanState::Established | ChanState::WrClosed => {}
					_ => return Err(io::Error::from_raw_os_error(libc::EBADF)),
				}
				let count = st.recvbuf.count();
				if count > 0 {
					let n = count.min(buf.len());
					st.recvbuf.get(&mut buf[..n]);
					st.recvseq = st.recvseq.wrapping_add(n as u32);
					st.flags |= CF_WINDOW;
					break n;
				}
			}
			notified.await;
		};
		// Wake the sender so it can send a window update.
		self.sender_wakeup();
		Ok(n)
	}

	/// Write bytes to a channel, blocking on flow control as needed.
	pub async fn chan_write(&self, id: ChanId, buf: &[u8]) -> io::Result<usize> {
		let chan = self
			.chan_get(id)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
		let mut pos = 0;
		while pos < buf.len() {
			let mut wrote = false;
			{
				let notified = chan.wr.notified();
				tokio::pin!(notified);
				notified.as_mut().enable();
				{
					let mut st = chan.inner.lock().unwrap();
					match st.state {
						ChanState::Established | ChanState::RdClosed => {}
						_ => return Err(io::Error::from_raw_os_error(libc::EPIPE)),
					}
					let avail = st.sendbuf.avail();
					if avail > 0 {
						let n = avail.min(buf.len() - pos);
						st.sendbuf.put(&buf[pos..pos + n]);
						pos += n;
						wrote = true;
					}
				}
				if !wrote {
					// Buffer full: let the sender drain it.
					self.sender_wakeup();
					notified.await;
				}
			}
		}
		self.sender_wakeup();
		Ok(buf.len())
	}

	/// Close the write side of a channel.  A CLOSE frame is scheduled;
	/// the channel reaches Closed once the peer closes too.
	pub fn chan_close(&self, id: ChanId) -> io::Result<()> {
		let chan = self
			.chan_get(id)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
		{
			let mut st = chan.inner.lock().unwrap();
			match st.state {
				ChanState::Established => {
					st.state = ChanState::WrClosed;
					st.flags |= CF_CLOSE;
				}
				ChanState::RdClosed => {
					st.state = ChanState::Closed;
					st.flags |= CF_CLOSE;
				}
				ChanState::WrClosed | ChanState::Closed => return Ok(()),
				_ => return Err(io::Error::from_raw_os_error(libc::EBADF)),
			}
		}
		self.sender_wakeup();
		Ok(())
	}

	/// Wait for a channel to be fully closed.
	pub async fn chan_wait(&self, id: ChanId) {
		let chan = match self.chan_get(id) {
			Some(chan) => chan,
			None => return,
		};
		loop {
			let notified = chan.rd.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let st = chan.inner.lock().unwrap();
				if st.state == ChanState::Closed {
					return;
				}
			}
			notified.await;
		}
	}

	fn sender_wakeup(&self) {
		self.newwork.notify_one();
	}

	/// Scan for work, clearing exactly one flag, by priority order.
	fn sender_scan(&self) -> Option<(Arc<Chan>, ChanId, u32)> {
		let inner = self.inner.lock().unwrap();
		for (i, slot) in inner.chans.iter().enumerate() {
			let chan = match slot {
				Some(chan) => chan,
				None => continue,
			};
			let mut st = chan.inner.lock().unwrap();
			if st.state == ChanState::Unused {
				continue;
			}
			if st.sendseq != st.sendwin && st.sendbuf.count() > 0 {
				st.flags |= CF_DATA;
			}
			if st.flags != 0 {
				// By order of importance.
				let what = [CF_CONNECT, CF_ACCEPT, CF_RESET, CF_WINDOW, CF_DATA, CF_CLOSE]
					.iter()
					.copied()
					.find(|f| st.flags & f != 0)
					.expect("flag vanished");
				st.flags &= !what;
				drop(st);
				return Some((chan.clone(), i as ChanId, what));
			}
		}
		None
	}

	/// Close all channels and stop the background tasks.  With an error
	/// given it is recorded and logged on behalf of `who`.
	fn shutdown(&self, who: Option<&str>, err: Option<MuxError>) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(e) = err {
			error!("{}: {}", who.unwrap_or("Mux"), e);
			*self.error.lock().unwrap() = Some(e);
		}
		let inner = self.inner.lock().unwrap();
		for chan in inner.chans.iter().flatten() {
			{
				let mut st = chan.inner.lock().unwrap();
				if st.state != ChanState::Unused {
					st.state = ChanState::Closed;
					st.flags = 0;
				}
			}
			chan.rd.notify_waiters();
			chan.wr.notify_waiters();
		}
		drop(inner);
		let _ = self.shutdown_tx.send(true);
		self.newwork.notify_one();
	}
}

async fn sender_loop<W>(mux: Arc<Mux>, mut sock: W, mut shutdown: watch::Receiver<bool>)
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	loop {
		// Wait until some channel has a pending flag.
		let (chan, id, what) = loop {
			if *shutdown.borrow() {
				return;
			}
			let notified = mux.newwork.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if let Some(work) = mux.sender_scan() {
				break work;
			}
			tokio::select! {
				_ = notified => {}
				_ = shutdown.changed() => return,
			}
		};

		let mut payload: Option<Vec<u8>> = None;
		let header = {
			let st = chan.inner.lock().unwrap();
			match what {
				CF_CONNECT | CF_ACCEPT => {
					let ptype = if what == CF_CONNECT { MUX_CONNECT } else { MUX_ACCEPT };
					let window = st.recvseq.wrapping_add(st.recvbuf.size as u32);
					let mut hdr = vec![ptype, id];
					hdr.extend_from_slice(&st.recvmss.to_be_bytes());
					hdr.extend_from_slice(&window.to_be_bytes());
					hdr
				}
				CF_RESET => vec![MUX_RESET, id],
				CF_WINDOW => {
					let window = st.recvseq.wrapping_add(st.recvbuf.size as u32);
					let mut hdr = vec![MUX_WINDOW, id];
					hdr.extend_from_slice(&window.to_be_bytes());
					hdr
				}
				CF_DATA => {
					let mut size = st.sendbuf.count().min(st.sendmss as usize);
					let winsize = st.sendwin.wrapping_sub(st.sendseq) as usize;
					if winsize < size {
						size = winsize;
					}
					let mut data = vec![0u8; size];
					st.sendbuf.peek_into(&mut data);
					payload = Some(data);
					let mut hdr = vec![MUX_DATA, id];
					hdr.extend_from_slice(&(size as u16).to_be_bytes());
					hdr
				}
				CF_CLOSE => vec![MUX_CLOSE, id],
				_ => unreachable!("unknown sender flag"),
			}
		};

		// The channel lock is not held during socket I/O: only this
		// task consumes the send ring, so the cursors are stable.
		let io = async {
			sock.write_all(&header).await?;
			if let Some(data) = &payload {
				sock.write_all(data).await?;
			}
			sock.flush().await
		};
		let res = tokio::select! {
			r = io => r,
			_ = shutdown.changed() => return,
		};
		if let Err(e) = res {
			mux.shutdown(Some("Sender"), Some(MuxError::Io(e)));
			return;
		}
		if let Some(data) = payload {
			let mut st = chan.inner.lock().unwrap();
			st.sendbuf.consume(data.len());
			st.sendseq = st.sendseq.wrapping_add(data.len() as u32);
			drop(st);
			chan.wr.notify_waiters();
		}
	}
}

async fn read_frame<R>(
	sock: &mut R,
	shutdown: &mut watch::Receiver<bool>,
	buf: &mut [u8],
) -> Result<(), RxStop>
where
	R: AsyncRead + Unpin,
{
	tokio::select! {
		r = sock.read_exact(buf) => match r {
			Ok(_) => Ok(()),
			Err(e) => Err(RxStop::Io(e)),
		},
		_ = shutdown.changed() => Err(RxStop::Shutdown),
	}
}

async fn receiver_loop<R>(mux: Arc<Mux>, mut sock: R, mut shutdown: watch::Receiver<bool>)
where
	R: AsyncRead + Unpin + Send + 'static,
{
	let mut scratch = vec![0u8; u16::MAX as usize];
	loop {
		let mut ptype = [0u8; 1];
		match read_frame(&mut sock, &mut shutdown, &mut ptype).await {
			Ok(()) => {}
			Err(RxStop::Shutdown) => return,
			Err(RxStop::Io(e)) => {
				let err = if e.kind() == io::ErrorKind::UnexpectedEof {
					MuxError::Io(io::Error::new(
						io::ErrorKind::ConnectionReset,
						"Connection reset by peer",
					))
				} else {
					MuxError::Io(e)
				};
				mux.shutdown(Some("Receiver"), Some(err));
				return;
			}
		}
		let res = match ptype[0] {
			MUX_CONNECT | MUX_ACCEPT => {
				let mut hdr = [0u8; 7];
				match read_frame(&mut sock, &mut shutdown, &mut hdr).await {
					Ok(()) => {}
					Err(stop) => return stop_receiver(&mux, stop),
				}
				let id = hdr[0];
				let mss = u16::from_be_bytes([hdr[1], hdr[2]]);
				let window = u32::from_be_bytes([hdr[3], hdr[4], hdr[5], hdr[6]]);
				handle_handshake(&mux, ptype[0], id, mss, window)
			}
			MUX_RESET => {
				let mut hdr = [0u8; 1];
				match read_frame(&mut sock, &mut shutdown, &mut hdr).await {
					Ok(()) => {}
					Err(stop) => return stop_receiver(&mux, stop),
				}
				Err(MuxError::Protocol)
			}
			MUX_WINDOW => {
				let mut hdr = [0u8; 5];
				match read_frame(&mut sock, &mut shutdown, &mut hdr).await {
					Ok(()) => {}
					Err(stop) => return stop_receiver(&mux, stop),
				}
				let id = hdr[0];
				let window = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
				handle_window(&mux, id, window)
			}
			MUX_DATA => {
				let mut hdr = [0u8; 3];
				match read_frame(&mut sock, &mut shutdown, &mut hdr).await {
					Ok(()) => {}
					Err(stop) => return stop_receiver(&mux, stop),
				}
				let id = hdr[0];
				let len = u16::from_be_bytes([hdr[1], hdr[2]]) as usize;
				match check_data(&mux, id, len) {
					Ok(chan) => {
						match read_frame(&mut sock, &mut shutdown, &mut scratch[..len]).await {
							Ok(()) => {}
							Err(stop) => return stop_receiver(&mux, stop),
						}
						let mut st = chan.inner.lock().unwrap();
						st.recvbuf.put(&scratch[..len]);
						drop(st);
						chan.rd.notify_waiters();
						Ok(())
					}
					Err(e) => Err(e),
				}
			}
			MUX_CLOSE => {
				let mut hdr = [0u8; 1];
				match read_frame(&mut sock, &mut shutdown, &mut hdr).await {
					Ok(()) => {}
					Err(stop) => return stop_receiver(&mux, stop),
				}
				handle_close(&mux, hdr[0])
			}
			_ => Err(MuxError::Protocol),
		};
		if let Err(e) = res {
			mux.shutdown(Some("Receiver"), Some(e));
			return;
		}
	}
}

fn stop_receiver(mux: &Mux, stop: RxStop) {
	match stop {
		RxStop::Shutdown => {}
		RxStop::Io(e) => mux.shutdown(Some("Receiver"), Some(MuxError::Io(e))),
	}
}

fn handle_handshake(mux: &Mux, ptype: u8, id: ChanId, mss: u16, window: u32) -> Result<(), MuxError> {
	let chan = match mux.chan_get(id) {
		Some(chan) => chan,
		None => return Err(MuxError::Protocol),
	};
	let mut st = chan.inner.lock().unwrap();
	if ptype == MUX_CONNECT {
		if st.state == ChanState::Listening {
			st.state = ChanState::Established;
			st.sendmss = mss;
			st.sendwin = window;
			st.flags |= CF_ACCEPT;
			drop(st);
			chan.rd.notify_waiters();
		} else {
			st.flags |= CF_RESET;
			drop(st);
		}
	} else {
		if st.state == ChanState::Connecting {
			st.sendmss = mss;
			st.sendwin = window;
			st.state = ChanState::Established;
			drop(st);
			chan.wr.notify_waiters();
		} else {
			st.flags |= CF_RESET;
			drop(st);
		}
	}
	mux.sender_wakeup();
	Ok(())
}

fn handle_window(mux: &Mux, id: ChanId, window: u32) -> Result<(), MuxError> {
	let chan = match mux.chan_get(id) {
		Some(chan) => chan,
		None => return Err(MuxError::Protocol),
	};
	let mut st = chan.inner.lock().unwrap();
	if st.state == ChanState::Established || st.state == ChanState::RdClosed {
		st.sendwin = window;
		drop(st);
		mux.sender_wakeup();
	}
	Ok(())
}

fn check_data(mux: &Mux, id: ChanId, len: usize) -> Result<Arc<Chan>, MuxError> {
	let chan = match mux.chan_get(id) {
		Some(chan) => chan,
		None => return Err(MuxError::Protocol),
	};
	let st = chan.inner.lock().unwrap();
	let state_ok = st.state == ChanState::Established || st.state == ChanState::WrClosed;
	if !state_ok || len > st.recvbuf.avail() || len > st.recvmss as usize {
		return Err(MuxError::Protocol);
	}
	drop(st);
	Ok(chan)
}

fn handle_close(mux: &Mux, id: ChanId) -> Result<(), MuxError> {
	let chan = match mux.chan_get(id) {
		Some(chan) => chan,
		None => return Err(MuxError::Protocol),
	};
	let mut st = chan.inner.lock().unwrap();
	match st.state {
		ChanState::Established => st.state = ChanState::RdClosed,
		ChanState::WrClosed => st.state = ChanState::Closed,
		_ => return Err(MuxError::Protocol),
	}
	drop(st);
	chan.rd.notify_waiters();
	Ok(())
}

/// Read half of a channel, for layering buffered streams on top.
#[derive(Debug)]
pub struct ChanReader {
	mux: Arc<Mux>,
	id: ChanId,
}

impl ChanReader {
	pub fn new(mux: Arc<Mux>, id: ChanId) -> Self {
		ChanReader { mux, id }
	}

	pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.mux.chan_read(self.id, buf).await
	}
}

/// Write half of a channel.
#[derive(Debug)]
pub struct ChanWriter {
	mux: Arc<Mux>,
	id: ChanId,
}

impl ChanWriter {
	pub fn new(mux: Arc<Mux>, id: ChanId) -> Self {
		ChanWriter { mux, id }
	}

	pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
		self.mux.chan_write(self.id, buf).await?;
		Ok(())
	}

	pub fn close(&mut self) -> io::Result<()> {
		self.mux.chan_close(self.id)
	}
}

// vim: ts=4
