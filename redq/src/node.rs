use std::{
    ffi::CString,
    fmt::Display,
    future::Future,
    hash::Hash,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use chrono::{DateTime, TimeDelta, Utc};
use clap::ValueEnum;
use redq_common::{
    AddressKey, Direction, ETH_HEADER_LEN, Endpoint, IPV4_MIN_HEADER_LEN, KeyVariant,
    LinkLayerKey, Packet, Verdict,
};
use serde::Serialize;
use tokio::{
    io::unix::AsyncFd,
    signal,
    sync::{oneshot, watch},
    task::{JoinError, JoinSet},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    accounting::Accounting,
    blocklist::Blocklist,
    filter::MacFilter,
    ledger::{UsageLedger, UsageRecord},
};

pub const DEFAULT_SNAPLEN: usize = 128;
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 1;
const TOP_TALKERS: usize = 10;

// linux/if_packet.h
const PACKET_OUTGOING: u8 = 4;

/// Identity the usage tables are keyed on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeyKind {
    /// Ethernet address of IPv4 and IPv6 frames.
    Mac,
    /// IPv4 address; other traffic is not accounted.
    Ipv4,
}

pub struct NodeOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub key: KeyKind,
    pub capacity: usize,
    pub blocklist: Option<PathBuf>,
    pub snaplen: usize,
    pub report_interval: Duration,
    pub idle_timeout: Duration,
    pub flush_interval: Duration,
}

/// Keys the node can account and report on.
pub trait ReportKey: Copy + Eq + Hash + Display + Serialize + Send + Sync + 'static {}

impl<T> ReportKey for T where T: Copy + Eq + Hash + Display + Serialize + Send + Sync + 'static {}

#[derive(Debug, Default)]
pub struct NodeStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub blocked: AtomicU64,
}

pub fn validate_options(opts: &NodeOptions) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(opts.workers > 0, "workers must be at least 1");
    ensure!(opts.capacity > 0, "table capacity must be greater than zero");
    ensure!(
        opts.snaplen >= ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN,
        "snaplen must cover the ethernet and IPv4 headers ({} bytes)",
        ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN
    );
    ensure!(!opts.report_interval.is_zero(), "report interval must be greater than zero");
    ensure!(!opts.idle_timeout.is_zero(), "idle timeout must be greater than zero");
    ensure!(
        opts.flush_interval >= opts.idle_timeout,
        "flush interval must not be shorter than the idle timeout"
    );
    Ok(())
}

pub async fn run_packet_pipeline(opts: NodeOptions) -> Result<()> {
    validate_options(&opts)?;
    match opts.key {
        KeyKind::Mac => run::<LinkLayerKey>(opts).await,
        KeyKind::Ipv4 => run::<AddressKey>(opts).await,
    }
}

async fn run<V>(opts: NodeOptions) -> Result<()>
where
    V: KeyVariant + 'static,
    V::Key: ReportKey,
{
    let blocklist = match opts.blocklist.as_deref() {
        Some(path) => Blocklist::from_path(path)?,
        None => Blocklist::new(),
    };
    let filter = MacFilter::new(Arc::new(blocklist));
    let accounting = Accounting::<V>::with_capacity(opts.capacity);
    let stats = Arc::new(NodeStats::default());
    let ledger = UsageLedger::new(
        TimeDelta::from_std(opts.idle_timeout).context("idle timeout out of range")?,
        TimeDelta::from_std(opts.flush_interval).context("flush interval out of range")?,
    );
    let fanout = fanout_group(opts.workers, opts.fanout_group);

    info!(
        iface = %opts.iface,
        workers = opts.workers,
        key = ?opts.key,
        capacity = accounting.table(Direction::Ingress).capacity(),
        blocked = filter.blocklist().len(),
        blocklist_capacity = filter.blocklist().capacity(),
        fanout = ?fanout,
        "starting packet pipeline"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for worker_id in 0..opts.workers {
        let worker = Worker {
            id: worker_id,
            accounting: accounting.clone(),
            filter: filter.clone(),
            stats: stats.clone(),
        };
        let iface = opts.iface.clone();
        let shutdown = shutdown_rx.clone();
        let snaplen = opts.snaplen;
        workers.spawn(async move { worker.run(&iface, fanout, snaplen, shutdown).await });
    }

    let (reporter_stop, reporter_stop_rx) = oneshot::channel();
    let reporter = tokio::spawn(report_loop(
        accounting,
        stats,
        ledger,
        opts.report_interval,
        reporter_stop_rx,
    ));

    let mut outcome = wait_for_shutdown(&mut workers, signal::ctrl_c()).await;
    if let Err(err) = &outcome {
        warn!(error = %err, "stopping packet pipeline");
    }
    let _ = shutdown_tx.send(true);

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = worker_result(joined) {
            warn!(error = %err, "worker failed");
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }

    // Workers are gone; the reporter's last pass sees every counted byte.
    let _ = reporter_stop.send(());
    reporter.await.map_err(|err| anyhow!("reporter panicked: {err}"))?;
    outcome
}

/// Resolves on the shutdown signal, or early with the error of the first
/// worker that fails. Workers only return `Ok` once shutdown was requested.
async fn wait_for_shutdown<F>(workers: &mut JoinSet<Result<()>>, signal: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::pin!(signal);
    loop {
        tokio::select! {
            result = &mut signal => {
                result.context("failed to wait for ctrl-c")?;
                info!("received shutdown signal, draining");
                return Ok(());
            }
            Some(joined) = workers.join_next() => worker_result(joined)?,
        }
    }
}

fn worker_result(joined: Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow!("worker panicked: {err}")),
    }
}

/// A single fanout member is pointless, several without a group would each
/// see every frame.
fn fanout_group(workers: usize, requested: Option<u16>) -> Option<u16> {
    match requested {
        Some(group) => Some(group),
        None if workers > 1 => Some(std::process::id() as u16),
        None => None,
    }
}

struct Worker<V: KeyVariant> {
    id: usize,
    accounting: Accounting<V>,
    filter: MacFilter,
    stats: Arc<NodeStats>,
}

impl<V: KeyVariant> Worker<V> {
    async fn run(
        self,
        iface: &str,
        fanout_group: Option<u16>,
        snaplen: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket = PacketSocket::bind(iface, fanout_group)
            .with_context(|| format!("worker {}: failed to bind packet socket", self.id))?;
        let mut buf = vec![0u8; snaplen];
        debug!(worker = self.id, iface, "worker listening");

        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => None,
                frame = socket.recv(&mut buf) => Some(frame),
            };
            let Some(frame) = received else {
                break;
            };
            let frame = frame.with_context(|| format!("worker {}: receive failed", self.id))?;
            self.handle_frame(&buf[..frame.captured], &frame);
        }

        debug!(worker = self.id, "worker stopped");
        Ok(())
    }

    fn handle_frame(&self, data: &[u8], frame: &Frame) -> Verdict {
        let packet = Packet::with_wire_len(data, frame.wire_len);
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(frame.wire_len as u64, Ordering::Relaxed);

        // Blocked frames never reach accounting.
        if frame.direction == Direction::Ingress && self.filter.process(&packet) == Verdict::Drop {
            self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            if let Some(source) = LinkLayerKey::extract(&packet, Endpoint::Source) {
                debug!(worker = self.id, %source, "frame from blocklisted source");
            }
            return Verdict::Drop;
        }

        self.accounting.process(&packet, frame.direction)
    }
}

async fn report_loop<V>(
    accounting: Accounting<V>,
    stats: Arc<NodeStats>,
    mut ledger: UsageLedger<V::Key>,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) where
    V: KeyVariant,
    V::Key: ReportKey,
{
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = &mut stop => true,
        };

        let now = Utc::now();
        collect(&accounting, &mut ledger, now);
        log_interval(&ledger, &stats);

        if stopping {
            emit_records(&ledger.take_all());
            break;
        }
        emit_records(&ledger.take_expired(now));
    }
}

/// Moves everything counted since the last call into the ledger.
pub fn collect<V: KeyVariant>(
    accounting: &Accounting<V>,
    ledger: &mut UsageLedger<V::Key>,
    now: DateTime<Utc>,
) {
    let ingress = accounting.table(Direction::Ingress).drain();
    let egress = accounting.table(Direction::Egress).drain();
    ledger.absorb(&ingress, &egress, now);
}

fn log_interval<K: ReportKey>(ledger: &UsageLedger<K>, stats: &NodeStats) {
    info!(
        frames = stats.frames.load(Ordering::Relaxed),
        bytes = stats.bytes.load(Ordering::Relaxed),
        blocked = stats.blocked.load(Ordering::Relaxed),
        tracked = ledger.len(),
        "usage interval"
    );
    for (key, ingress, egress) in ledger.top_rates(TOP_TALKERS) {
        debug!(%key, ingress, egress, "interval usage");
    }
}

fn emit_records<K: ReportKey>(records: &[UsageRecord<K>]) {
    for record in records {
        match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(key = %record.key, error = %err, "failed to encode usage record"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Frame {
    captured: usize,
    wire_len: usize,
    direction: Direction,
}

struct PacketSocket {
    fd: AsyncFd<OwnedFd>,
}

impl PacketSocket {
    fn bind(iface: &str, fanout_group: Option<u16>) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }
        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        bind_interface(owned_fd.as_raw_fd(), iface, protocol)?;
        configure_fanout(owned_fd.as_raw_fd(), fanout_group)?;

        let fd = AsyncFd::new(owned_fd).context("failed to register packet socket")?;
        Ok(Self { fd })
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<Frame> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_frame(inner.get_ref().as_raw_fd(), &mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Receives one frame. `MSG_TRUNC` makes the kernel report the full length
/// even when only `buf.len()` bytes were copied.
fn recv_frame(fd: RawFd, buf: &mut [u8]) -> io::Result<Frame> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_TRUNC,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let wire_len = rc as usize;
    Ok(Frame {
        captured: wire_len.min(buf.len()),
        wire_len,
        direction: direction_of(addr.sll_pkttype),
    })
}

fn direction_of(pkttype: u8) -> Direction {
    if pkttype == PACKET_OUTGOING {
        Direction::Egress
    } else {
        Direction::Ingress
    }
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<()> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to look up interface {iface}"));
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to bind packet socket to {iface}"));
    }
    Ok(())
}

fn configure_fanout(fd: RawFd, fanout_group: Option<u16>) -> Result<()> {
    let Some(group) = fanout_group else {
        return Ok(());
    };
    let val: u32 = (group as u32) | ((libc::PACKET_FANOUT_HASH as u32) << 16);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_FANOUT,
            &val as *const _ as *const libc::c_void,
            mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to join PACKET_FANOUT group {group}"));
    }
    Ok(())
}
