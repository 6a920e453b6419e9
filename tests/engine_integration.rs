//! End-to-end tests driving the engine over real descriptors.

use std::ffi::CString;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use proact::{
    AcceptError, CancelError, CancelTimeoutError, CloseError, Completion, ConnectError, Engine,
    FsyncError, LinkedCompletion, OpenAtError, ReadError, RecvError, SendError, TimeoutError,
    WriteError,
};
use socket2::{Domain, Protocol, Socket, Type};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Tick the engine until the condition holds or the deadline passes.
fn drive(io: &mut Engine, deadline: Duration, done: impl Fn() -> bool) {
    let start = Instant::now();
    while !done() {
        io.tick().unwrap();
        assert!(
            start.elapsed() <= deadline,
            "engine made no progress within {:?}",
            deadline
        );
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// A connected TCP pair: the engine drives `client`, the test peers via
/// `server` with blocking std I/O.
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    (client, server)
}

// ============================================================================
// File round-trip: openat -> write -> fsync -> read -> close
// ============================================================================

struct FileCtx {
    fd: RawFd,
    wbuf: [u8; 20],
    rbuf: [u8; 20],
    written: usize,
    read: usize,
    done: bool,
}

fn file_on_open(
    ctx: &mut FileCtx,
    io: &mut Engine,
    c: &mut Completion,
    result: Result<RawFd, OpenAtError>,
) {
    ctx.fd = result.expect("openat");
    let p = ctx as *mut FileCtx;
    io.write(p, file_on_write, c, ctx.fd, &ctx.wbuf, 10);
}

fn file_on_write(
    ctx: &mut FileCtx,
    io: &mut Engine,
    c: &mut Completion,
    result: Result<usize, WriteError>,
) {
    ctx.written = result.expect("write");
    let p = ctx as *mut FileCtx;
    io.fsync(p, file_on_fsync, c, ctx.fd);
}

fn file_on_fsync(
    ctx: &mut FileCtx,
    io: &mut Engine,
    c: &mut Completion,
    result: Result<(), FsyncError>,
) {
    result.expect("fsync");
    let p = ctx as *mut FileCtx;
    let fd = ctx.fd;
    io.read(p, file_on_read, c, fd, &mut ctx.rbuf, 10);
}

fn file_on_read(
    ctx: &mut FileCtx,
    io: &mut Engine,
    c: &mut Completion,
    result: Result<usize, ReadError>,
) {
    ctx.read = result.expect("read");
    let p = ctx as *mut FileCtx;
    io.close(p, file_on_close, c, ctx.fd);
}

fn file_on_close(
    ctx: &mut FileCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), CloseError>,
) {
    result.expect("close");
    ctx.done = true;
}

#[test]
fn test_file_write_fsync_read_roundtrip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.dat");
    let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = FileCtx {
        fd: -1,
        wbuf: [0x61; 20],
        rbuf: [0; 20],
        written: 0,
        read: 0,
        done: false,
    };
    let mut completion = Completion::new();

    let p = &mut ctx as *mut FileCtx;
    io.openat(
        p,
        file_on_open,
        &mut completion,
        libc::AT_FDCWD,
        &cpath,
        libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
        0o666,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.done);

    assert_eq!(ctx.written, 20);
    assert_eq!(ctx.read, 20);
    assert_eq!(ctx.rbuf, ctx.wbuf);
    assert!(io.is_idle());
}

// ============================================================================
// Accept / connect / send / recv on one engine
// ============================================================================

struct NetCtx {
    accepted_fd: RawFd,
    accepted: bool,
    connected: bool,
    sent: usize,
    received: usize,
    send_done: bool,
    recv_done: bool,
}

fn net_on_accept(
    ctx: &mut NetCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<RawFd, AcceptError>,
) {
    ctx.accepted_fd = result.expect("accept");
    ctx.accepted = true;
}

fn net_on_connect(
    ctx: &mut NetCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), ConnectError>,
) {
    result.expect("connect");
    ctx.connected = true;
}

fn net_on_send(
    ctx: &mut NetCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, SendError>,
) {
    ctx.sent = result.expect("send");
    ctx.send_done = true;
}

fn net_on_recv(
    ctx: &mut NetCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, RecvError>,
) {
    ctx.received = result.expect("recv");
    ctx.recv_done = true;
}

#[test]
fn test_accept_connect_send_recv() {
    init_tracing();
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    listener.set_reuse_address(true).unwrap();
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind_addr.into()).unwrap();
    listener.listen(1).unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let client = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = NetCtx {
        accepted_fd: -1,
        accepted: false,
        connected: false,
        sent: 0,
        received: 0,
        send_done: false,
        recv_done: false,
    };
    let mut accept_c = Completion::new();
    let mut connect_c = Completion::new();

    let p = &mut ctx as *mut NetCtx;
    io.accept(p, net_on_accept, &mut accept_c, listener.as_raw_fd());
    io.connect(p, net_on_connect, &mut connect_c, client.as_raw_fd(), addr);
    drive(&mut io, Duration::from_secs(5), || {
        ctx.accepted && ctx.connected
    });

    let send_buf: [u8; 10] = [1, 0, 1, 0, 1, 0, 1, 0, 1, 0];
    let mut recv_buf = [0u8; 5];
    io.send(p, net_on_send, &mut connect_c, client.as_raw_fd(), &send_buf);
    io.recv(p, net_on_recv, &mut accept_c, ctx.accepted_fd, &mut recv_buf);
    drive(&mut io, Duration::from_secs(5), || {
        ctx.send_done && ctx.recv_done
    });

    assert_eq!(ctx.sent, 10);
    assert_eq!(ctx.received, 5);
    assert_eq!(&recv_buf[..], &send_buf[..5]);
    assert!(io.is_idle());

    // The accepted fd is ours to close.
    unsafe { libc::close(ctx.accepted_fd) };
}

// ============================================================================
// Linked receive timeouts
// ============================================================================

struct LinkedRecvCtx {
    result: Option<Result<usize, RecvError>>,
}

fn linked_on_recv(
    ctx: &mut LinkedRecvCtx,
    _io: &mut Engine,
    _linked: &mut LinkedCompletion,
    result: Result<usize, RecvError>,
) {
    assert!(ctx.result.is_none(), "composite callback fired twice");
    ctx.result = Some(result);
}

#[test]
fn test_recv_with_timeout_fires_on_idle_socket() {
    init_tracing();
    let (client, _server) = tcp_pair();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = LinkedRecvCtx { result: None };
    let mut linked = LinkedCompletion::new();
    let mut buf = [0u8; 16];

    io.recv_with_timeout(
        &mut ctx as *mut LinkedRecvCtx,
        linked_on_recv,
        &mut linked,
        client.as_raw_fd(),
        &mut buf,
        1_000_000,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.result.is_some());

    assert_eq!(ctx.result, Some(Err(RecvError::Canceled)));
    assert_eq!(linked.timeout_outcome(), Some(Ok(())));
}

#[test]
fn test_recv_with_timeout_data_arrives_first() {
    init_tracing();
    let (client, mut server) = tcp_pair();
    server.write_all(&[1, 0, 1, 0, 1]).unwrap();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = LinkedRecvCtx { result: None };
    let mut linked = LinkedCompletion::new();
    let mut buf = [0u8; 16];

    io.recv_with_timeout(
        &mut ctx as *mut LinkedRecvCtx,
        linked_on_recv,
        &mut linked,
        client.as_raw_fd(),
        &mut buf,
        100_000_000,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.result.is_some());

    assert_eq!(ctx.result, Some(Ok(5)));
    assert_eq!(
        linked.timeout_outcome(),
        Some(Err(TimeoutError::Canceled))
    );
    assert_eq!(&buf[..5], &[1, 0, 1, 0, 1]);
}

struct LinkedSendCtx {
    result: Option<Result<usize, SendError>>,
}

fn linked_on_send(
    ctx: &mut LinkedSendCtx,
    _io: &mut Engine,
    _linked: &mut LinkedCompletion,
    result: Result<usize, SendError>,
) {
    ctx.result = Some(result);
}

#[test]
fn test_send_with_timeout_completes_before_deadline() {
    init_tracing();
    let (client, _server) = tcp_pair();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = LinkedSendCtx { result: None };
    let mut linked = LinkedCompletion::new();
    let buf: [u8; 10] = [1, 0, 1, 0, 1, 0, 1, 0, 1, 0];

    io.send_with_timeout(
        &mut ctx as *mut LinkedSendCtx,
        linked_on_send,
        &mut linked,
        client.as_raw_fd(),
        &buf,
        100_000_000,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.result.is_some());

    assert_eq!(ctx.result, Some(Ok(10)));
    assert_eq!(
        linked.timeout_outcome(),
        Some(Err(TimeoutError::Canceled))
    );
}

struct LinkedConnectCtx {
    result: Option<Result<(), ConnectError>>,
}

fn linked_on_connect(
    ctx: &mut LinkedConnectCtx,
    _io: &mut Engine,
    _linked: &mut LinkedCompletion,
    result: Result<(), ConnectError>,
) {
    ctx.result = Some(result);
}

#[test]
fn test_connect_with_timeout_completes_before_deadline() {
    init_tracing();
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind_addr.into()).unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let client = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = LinkedConnectCtx { result: None };
    let mut linked = LinkedCompletion::new();

    io.connect_with_timeout(
        &mut ctx as *mut LinkedConnectCtx,
        linked_on_connect,
        &mut linked,
        client.as_raw_fd(),
        addr,
        1_000_000_000,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.result.is_some());

    assert_eq!(ctx.result, Some(Ok(())));
    assert_eq!(
        linked.timeout_outcome(),
        Some(Err(TimeoutError::Canceled))
    );
}

// ============================================================================
// Scatter-gather messages
// ============================================================================

struct MsgCtx {
    sent: Option<Result<usize, SendError>>,
    received: Option<Result<usize, RecvError>>,
}

fn msg_on_send(
    ctx: &mut MsgCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, SendError>,
) {
    ctx.sent = Some(result);
}

fn msg_on_recv(
    ctx: &mut MsgCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, RecvError>,
) {
    ctx.received = Some(result);
}

#[test]
fn test_sendmsg_recvmsg_datagram() {
    init_tracing();
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let sender = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
    sender.bind(&bind_addr.into()).unwrap();
    sender.set_nonblocking(true).unwrap();
    let receiver = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
    receiver.bind(&bind_addr.into()).unwrap();
    receiver.set_nonblocking(true).unwrap();
    let receiver_addr = receiver.local_addr().unwrap().as_socket().unwrap();

    // Destination and scatter-gather state live until the callbacks fire.
    let mut dest: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    dest.sin_family = libc::AF_INET as libc::sa_family_t;
    dest.sin_port = receiver_addr.port().to_be();
    dest.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);

    let payload = [7u8; 12];
    let mut send_iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut send_msg: libc::msghdr = unsafe { std::mem::zeroed() };
    send_msg.msg_name = &mut dest as *mut libc::sockaddr_in as *mut libc::c_void;
    send_msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    send_msg.msg_iov = &mut send_iov;
    send_msg.msg_iovlen = 1;

    let mut rbuf = [0u8; 32];
    let mut recv_iov = libc::iovec {
        iov_base: rbuf.as_mut_ptr() as *mut libc::c_void,
        iov_len: rbuf.len(),
    };
    let mut src: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut recv_msg: libc::msghdr = unsafe { std::mem::zeroed() };
    recv_msg.msg_name = &mut src as *mut libc::sockaddr_storage as *mut libc::c_void;
    recv_msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    recv_msg.msg_iov = &mut recv_iov;
    recv_msg.msg_iovlen = 1;

    let mut io = Engine::new(32).unwrap();
    let mut ctx = MsgCtx {
        sent: None,
        received: None,
    };
    let mut send_c = Completion::new();
    let mut recv_c = Completion::new();

    let p = &mut ctx as *mut MsgCtx;
    io.recvmsg(p, msg_on_recv, &mut recv_c, receiver.as_raw_fd(), &mut recv_msg);
    io.sendmsg(p, msg_on_send, &mut send_c, sender.as_raw_fd(), &send_msg);
    drive(&mut io, Duration::from_secs(5), || {
        ctx.sent.is_some() && ctx.received.is_some()
    });

    assert_eq!(ctx.sent, Some(Ok(12)));
    assert_eq!(ctx.received, Some(Ok(12)));
    assert_eq!(&rbuf[..12], &payload[..]);
}

// ============================================================================
// Cancellation
// ============================================================================

struct CancelCtx {
    recv_result: Option<Result<usize, RecvError>>,
    cancel_result: Option<Result<(), CancelError>>,
}

fn cancel_on_recv(
    ctx: &mut CancelCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, RecvError>,
) {
    ctx.recv_result = Some(result);
}

fn cancel_on_cancel(
    ctx: &mut CancelCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), CancelError>,
) {
    ctx.cancel_result = Some(result);
}

#[test]
fn test_cancel_in_flight_recv() {
    init_tracing();
    let (client, _server) = tcp_pair();

    let mut io = Engine::new(32).unwrap();
    let mut ctx = CancelCtx {
        recv_result: None,
        cancel_result: None,
    };
    let mut recv_c = Completion::new();
    let mut cancel_c = Completion::new();
    let mut buf = [0u8; 16];

    let p = &mut ctx as *mut CancelCtx;
    io.recv(p, cancel_on_recv, &mut recv_c, client.as_raw_fd(), &mut buf);
    io.cancel(p, cancel_on_cancel, &mut cancel_c, &mut recv_c);
    drive(&mut io, Duration::from_secs(5), || {
        ctx.recv_result.is_some() && ctx.cancel_result.is_some()
    });

    assert_eq!(ctx.recv_result, Some(Err(RecvError::Canceled)));
    assert_eq!(ctx.cancel_result, Some(Ok(())));
}

struct CancelTimerCtx {
    timeout_result: Option<Result<(), TimeoutError>>,
    cancel_result: Option<Result<(), CancelTimeoutError>>,
}

fn timer_on_fire(
    ctx: &mut CancelTimerCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), TimeoutError>,
) {
    ctx.timeout_result = Some(result);
}

fn timer_on_cancel(
    ctx: &mut CancelTimerCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), CancelTimeoutError>,
) {
    ctx.cancel_result = Some(result);
}

#[test]
fn test_cancel_timeout_before_it_fires() {
    init_tracing();
    let mut io = Engine::new(32).unwrap();
    let mut ctx = CancelTimerCtx {
        timeout_result: None,
        cancel_result: None,
    };
    let mut timer_c = Completion::new();
    let mut cancel_c = Completion::new();

    let p = &mut ctx as *mut CancelTimerCtx;
    io.timeout(p, timer_on_fire, &mut timer_c, 100_000_000);
    io.cancel_timeout(p, timer_on_cancel, &mut cancel_c, &mut timer_c);
    drive(&mut io, Duration::from_secs(5), || {
        ctx.timeout_result.is_some() && ctx.cancel_result.is_some()
    });

    assert_eq!(ctx.timeout_result, Some(Err(TimeoutError::Canceled)));
    assert_eq!(ctx.cancel_result, Some(Ok(())));
}

// ============================================================================
// Timers, run_for_ns, submission overflow
// ============================================================================

struct CounterCtx {
    fired: u32,
}

fn counter_on_fire(
    ctx: &mut CounterCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<(), TimeoutError>,
) {
    result.expect("timeout");
    ctx.fired += 1;
}

#[test]
fn test_run_for_ns_with_pending_timers() {
    init_tracing();
    let mut io = Engine::new(32).unwrap();
    let mut ctx = CounterCtx { fired: 0 };
    let mut completions: Vec<Completion> = (0..10).map(|_| Completion::new()).collect();

    let p = &mut ctx as *mut CounterCtx;
    for completion in completions.iter_mut() {
        io.timeout(p, counter_on_fire, completion, 20_000_000);
    }

    let start = Instant::now();
    io.run_for_ns(30_000_000).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(ctx.fired, 10);
    assert!(elapsed >= Duration::from_millis(29), "returned after {:?}", elapsed);
    assert!(io.is_idle());
    assert_eq!(io.total_submitted(), 10);
    assert_eq!(io.total_completed(), 10);
}

#[test]
fn test_submission_queue_overflow() {
    init_tracing();
    // One entry forces nine of the ten submissions through the overflow
    // queue.
    let mut io = Engine::new(1).unwrap();
    let mut ctx = CounterCtx { fired: 0 };
    let mut completions: Vec<Completion> = (0..10).map(|_| Completion::new()).collect();

    let p = &mut ctx as *mut CounterCtx;
    for completion in completions.iter_mut() {
        io.timeout(p, counter_on_fire, completion, 20_000_000);
    }
    drive(&mut io, Duration::from_secs(10), || ctx.fired == 10);

    assert_eq!(ctx.fired, 10);
    assert!(io.is_idle());
}

#[test]
fn test_run_for_ns_returns_no_earlier_than_deadline() {
    init_tracing();
    let mut io = Engine::new(8).unwrap();
    let start = Instant::now();
    io.run_for_ns(10_000_000).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(9));
}

// ============================================================================
// Completion reuse and failure paths
// ============================================================================

struct RepeatCtx {
    fired: u32,
}

fn repeat_on_fire(
    ctx: &mut RepeatCtx,
    io: &mut Engine,
    c: &mut Completion,
    result: Result<(), TimeoutError>,
) {
    result.expect("timeout");
    ctx.fired += 1;
    if ctx.fired < 3 {
        // The record is the caller's again: resubmit it in place.
        let p = ctx as *mut RepeatCtx;
        io.timeout(p, repeat_on_fire, c, 1_000_000);
    }
}

#[test]
fn test_completion_reusable_from_its_own_callback() {
    init_tracing();
    let mut io = Engine::new(8).unwrap();
    let mut ctx = RepeatCtx { fired: 0 };
    let mut completion = Completion::new();

    io.timeout(
        &mut ctx as *mut RepeatCtx,
        repeat_on_fire,
        &mut completion,
        1_000_000,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.fired == 3);

    assert_eq!(ctx.fired, 3);
    assert!(io.is_idle());
}

struct BadFdCtx {
    result: Option<Result<usize, RecvError>>,
}

fn bad_fd_on_recv(
    ctx: &mut BadFdCtx,
    _io: &mut Engine,
    _c: &mut Completion,
    result: Result<usize, RecvError>,
) {
    ctx.result = Some(result);
}

#[test]
fn test_recv_on_invalid_fd_reports_typed_error() {
    init_tracing();
    let mut io = Engine::new(8).unwrap();
    let mut ctx = BadFdCtx { result: None };
    let mut completion = Completion::new();
    let mut buf = [0u8; 8];

    io.recv(
        &mut ctx as *mut BadFdCtx,
        bad_fd_on_recv,
        &mut completion,
        -1,
        &mut buf,
    );
    drive(&mut io, Duration::from_secs(5), || ctx.result.is_some());

    assert_eq!(ctx.result, Some(Err(RecvError::FileDescriptorInvalid)));
}
