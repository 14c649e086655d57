//! Sliding-window ARQ engine, wire compatible with the reference KCP algorithm.
//!
//! The engine performs no I/O and reads no clock. Datagrams produced by a flush are handed to an
//! [`Output`] supplied by the caller of [`Arq::update`] / [`Arq::flush`], and all timestamps are
//! caller-provided milliseconds. Sequence numbers and timestamps are compared with wrapping
//! arithmetic throughout.

mod segment;

use std::collections::VecDeque;

use thiserror::Error;

use crate::frame::serial::Reader;

pub use segment::OVERHEAD;
use segment::{Command, Header, Segment, SegmentPool};

// No-delay minimum RTO
pub const RTO_NDL: u32 = 30;
// Normal minimum RTO
pub const RTO_MIN: u32 = 100;
pub const RTO_DEF: u32 = 200;
pub const RTO_MAX: u32 = 60_000;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

pub const WND_SND: u32 = 32;
pub const WND_RCV: u32 = 128;
pub const MTU_DEF: usize = 1200;
pub const MTU_MIN: usize = 50;

pub const INTERVAL: u32 = 100;
pub const INTERVAL_MIN: u32 = 10;
pub const INTERVAL_MAX: u32 = 5000;

/// Maximum number of fragments per message (the fragment countdown is one byte).
pub const FRG_MAX: usize = 255;

pub const DEADLINK: u32 = 20;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;

// Window probe backoff bounds
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

const FASTACK_LIMIT: u32 = 5;

// Flush schedules further than this from the clock are considered stale and reset
const FLUSH_SLAP_MAX: i32 = 10_000;

/// Signed distance from `earlier` to `later`, robust to wraparound.
#[inline]
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Receives datagrams produced by the engine.
pub trait Output {
    fn output(&mut self, bytes: &[u8]);
}

impl<F> Output for F
where
    F: FnMut(&[u8]),
{
    fn output(&mut self, bytes: &[u8]) {
        self(bytes)
    }
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum SendError {
    #[error("message of {len} bytes requires {count} fragments, but at most 255 are allowed")]
    TooManyFragments { len: usize, count: usize },
    #[error("message requires {count} fragments, which exceeds the receive window of {rcv_wnd}")]
    WindowTooSmall { count: usize, rcv_wnd: u32 },
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum InputError {
    #[error("datagram is too short to contain a segment")]
    Truncated,
    #[error("conversation id mismatch: expected {expected}, found {found}")]
    ConvMismatch { expected: u32, found: u32 },
    #[error("segment declares {len} payload bytes, but only {remaining} remain")]
    LengthOverflow { len: u32, remaining: usize },
    #[error("unknown segment command {0}")]
    UnknownCommand(u8),
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum RecvError {
    #[error("no message is available")]
    Empty,
    #[error("the next message has not been fully received")]
    Incomplete,
    #[error("message of {size} bytes does not fit in a buffer of {capacity} bytes")]
    BufferTooSmall { size: usize, capacity: usize },
}

pub struct Arq {
    conv: u32,
    mtu: usize,
    mss: usize,
    // Set once a segment has been transmitted dead_link times without acknowledgement
    dead: bool,

    // Sequence cursors
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    // Congestion state
    ssthresh: u32,
    cwnd: u32,
    incr: u32,

    // RTT estimator
    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,

    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,

    // Total retransmissions due to RTO expiry
    xmit: u32,
    nodelay: u32,
    dead_link: u32,
    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,

    // Not yet sent
    snd_queue: VecDeque<Segment>,
    // Sent, not yet acknowledged, ordered by sn
    snd_buf: VecDeque<Segment>,
    // In order, ready to be read
    rcv_queue: VecDeque<Segment>,
    // Out of order arrivals, ordered by sn
    rcv_buf: VecDeque<Segment>,

    // (sn, ts) pairs to acknowledge on the next flush
    acklist: Vec<(u32, u32)>,

    // Scratch space for outgoing datagrams
    buffer: Box<[u8]>,

    pool: SegmentPool,
}

fn scratch_buffer(mtu: usize) -> Box<[u8]> {
    vec![0; (mtu + OVERHEAD) * 3].into_boxed_slice()
}

/// Emits the pending datagram if `space` more bytes would not fit in the MTU.
fn make_space<O>(buffer: &[u8], offset: &mut usize, space: usize, mtu: usize, output: &mut O)
where
    O: Output,
{
    if *offset + space > mtu {
        output.output(&buffer[..*offset]);
        *offset = 0;
    }
}

impl Arq {
    pub fn new(conv: u32) -> Self {
        Self {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - OVERHEAD,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            cwnd: 0,
            incr: 0,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            updated: false,
            xmit: 0,
            nodelay: 0,
            dead_link: DEADLINK,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: scratch_buffer(MTU_DEF),
            pool: SegmentPool::default(),
        }
    }

    /// Splits `data` into MSS-sized fragments and queues them for sending.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        let len = data.len();

        let count = if len <= self.mss {
            1
        } else {
            (len + self.mss - 1) / self.mss
        };

        if count > FRG_MAX {
            return Err(SendError::TooManyFragments { len, count });
        }

        if count as u32 >= self.rcv_wnd {
            return Err(SendError::WindowTooSmall {
                count,
                rcv_wnd: self.rcv_wnd,
            });
        }

        let mut offset = 0;

        for i in 0..count {
            let size = (len - offset).min(self.mss);

            let mut segment = self.pool.take();
            segment.data.extend_from_slice(&data[offset..offset + size]);
            segment.frg = (count - i - 1) as u8;

            self.snd_queue.push_back(segment);

            offset += size;
        }

        Ok(())
    }

    /// Returns the size of the next complete message in the receive queue.
    pub fn peek_size(&self) -> Result<usize, RecvError> {
        let front = self.rcv_queue.front().ok_or(RecvError::Empty)?;

        if front.frg == 0 {
            return Ok(front.data.len());
        }

        if self.rcv_queue.len() < usize::from(front.frg) + 1 {
            return Err(RecvError::Incomplete);
        }

        let mut length = 0;

        for segment in self.rcv_queue.iter() {
            length += segment.data.len();

            if segment.frg == 0 {
                break;
            }
        }

        Ok(length)
    }

    /// Reassembles the next complete message into `buffer`, returning its length.
    pub fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, RecvError> {
        let size = self.peek_size()?;

        if size > buffer.len() {
            return Err(RecvError::BufferTooSmall {
                size,
                capacity: buffer.len(),
            });
        }

        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut len = 0;

        while let Some(segment) = self.rcv_queue.pop_front() {
            let frg = segment.frg;

            buffer[len..len + segment.data.len()].copy_from_slice(&segment.data);
            len += segment.data.len();

            self.pool.give(segment);

            if frg == 0 {
                break;
            }
        }

        debug_assert_eq!(len, size);

        self.move_ready_to_queue();

        // The receive window has reopened, tell the remote
        if self.rcv_queue.len() < self.rcv_wnd as usize && recover {
            self.probe |= ASK_TELL;
        }

        Ok(len)
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(segment) => segment.sn,
            None => self.snd_nxt,
        };
    }

    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = u64::from(rtt.abs_diff(self.rx_srtt));
            self.rx_rttval = ((3 * u64::from(self.rx_rttval) + delta) / 4) as u32;
            self.rx_srtt = ((7 * u64::from(self.rx_srtt) + u64::from(rtt)) / 8) as u32;
            self.rx_srtt = self.rx_srtt.max(1);
        }

        let rto = u64::from(self.rx_srtt)
            + u64::from(self.interval).max(4 * u64::from(self.rx_rttval));

        self.rx_rto = rto.clamp(u64::from(self.rx_minrto), u64::from(RTO_MAX)) as u32;
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        let mut found = None;

        for (i, segment) in self.snd_buf.iter().enumerate() {
            if sn == segment.sn {
                found = Some(i);
                break;
            }
            if time_diff(sn, segment.sn) < 0 {
                break;
            }
        }

        if let Some(segment) = found.and_then(|i| self.snd_buf.remove(i)) {
            self.pool.give(segment);
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(segment) = self.snd_buf.front() {
            if time_diff(una, segment.sn) <= 0 {
                break;
            }

            if let Some(segment) = self.snd_buf.pop_front() {
                self.pool.give(segment);
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for segment in self.snd_buf.iter_mut() {
            if time_diff(sn, segment.sn) < 0 {
                break;
            } else if sn != segment.sn {
                segment.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, new_segment: Segment) {
        let sn = new_segment.sn;

        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0
            || time_diff(sn, self.rcv_nxt) < 0
        {
            self.pool.give(new_segment);
            return;
        }

        // Scan from the back, most arrivals are at or near the end
        let mut insert_idx = 0;
        let mut repeat = false;

        for (i, segment) in self.rcv_buf.iter().enumerate().rev() {
            if segment.sn == sn {
                repeat = true;
                break;
            }
            if time_diff(sn, segment.sn) > 0 {
                insert_idx = i + 1;
                break;
            }
        }

        if repeat {
            self.pool.give(new_segment);
        } else {
            self.rcv_buf.insert(insert_idx, new_segment);
        }

        self.move_ready_to_queue();
    }

    fn move_ready_to_queue(&mut self) {
        while let Some(segment) = self.rcv_buf.front() {
            if segment.sn != self.rcv_nxt || self.rcv_queue.len() >= self.rcv_wnd as usize {
                break;
            }

            if let Some(segment) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(segment);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    /// Processes one or more concatenated segments received from the remote.
    ///
    /// Segments are processed in order; on error, processing stops and the remainder of the
    /// datagram is discarded.
    pub fn input(&mut self, data: &[u8]) -> Result<(), InputError> {
        if data.len() < OVERHEAD {
            return Err(InputError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        let mut rd = Reader::new(data);

        while let Some(header) = Header::read(&mut rd) {
            if header.conv != self.conv {
                return Err(InputError::ConvMismatch {
                    expected: self.conv,
                    found: header.conv,
                });
            }

            let payload = match rd.read_slice(header.len as usize) {
                Some(payload) => payload,
                None => {
                    return Err(InputError::LengthOverflow {
                        len: header.len,
                        remaining: rd.remaining(),
                    })
                }
            };

            let cmd = Command::from_u8(header.cmd).ok_or(InputError::UnknownCommand(header.cmd))?;

            self.rmt_wnd = u32::from(header.wnd);
            self.parse_una(header.una);
            self.shrink_buf();

            match cmd {
                Command::Ack => {
                    let rtt = time_diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }

                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        Some(sn) if time_diff(header.sn, sn) <= 0 => Some(sn),
                        _ => Some(header.sn),
                    };
                }
                Command::Push => {
                    if time_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((header.sn, header.ts));

                        if time_diff(header.sn, self.rcv_nxt) >= 0 {
                            let mut segment = self.pool.take();
                            segment.conv = header.conv;
                            segment.cmd = cmd;
                            segment.frg = header.frg;
                            segment.wnd = header.wnd;
                            segment.ts = header.ts;
                            segment.sn = header.sn;
                            segment.una = header.una;
                            segment.data.extend_from_slice(payload);

                            self.parse_data(segment);
                        }
                    }
                }
                Command::WindowProbe => {
                    self.probe |= ASK_TELL;
                }
                Command::WindowResponse => {}
            }
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }

        // Grow the congestion window if new data was acknowledged
        if time_diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            // Widened, mss * mss overflows u32 for jumbo MTUs
            let mss = self.mss as u64;
            let mut incr = u64::from(self.incr);

            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                incr += mss;
            } else {
                if incr < mss {
                    incr = mss;
                }
                incr += (mss * mss) / incr + (mss / 16);
                if (u64::from(self.cwnd) + 1) * mss <= incr {
                    let cwnd = (incr + mss - 1) / mss.max(1);
                    self.cwnd = u32::try_from(cwnd).unwrap_or(u32::MAX);
                }
            }

            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                incr = u64::from(self.rmt_wnd) * mss;
            }

            self.incr = u32::try_from(incr).unwrap_or(u32::MAX);
        }

        Ok(())
    }

    fn wnd_unused(&self) -> u16 {
        let queued = self.rcv_queue.len() as u32;

        if queued < self.rcv_wnd {
            (self.rcv_wnd - queued).min(u32::from(u16::MAX)) as u16
        } else {
            0
        }
    }

    /// Emits acks, window probes, new data and retransmissions, in that order.
    pub fn flush<O>(&mut self, output: &mut O)
    where
        O: Output,
    {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();

        let mut offset = 0;
        let mut lost = false;
        let mut change = 0;

        let mut control = Segment {
            conv: self.conv,
            cmd: Command::Ack,
            wnd,
            una: self.rcv_nxt,
            ..Default::default()
        };

        for &(sn, ts) in self.acklist.iter() {
            make_space(&self.buffer, &mut offset, OVERHEAD, self.mtu, output);
            control.sn = sn;
            control.ts = ts;
            offset += control.encode_header(&mut self.buffer[offset..]);
        }

        self.acklist.clear();

        // Probe the remote window if it is closed
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if time_diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        control.sn = 0;
        control.ts = 0;

        if self.probe & ASK_SEND != 0 {
            control.cmd = Command::WindowProbe;
            make_space(&self.buffer, &mut offset, OVERHEAD, self.mtu, output);
            offset += control.encode_header(&mut self.buffer[offset..]);
        }

        if self.probe & ASK_TELL != 0 {
            control.cmd = Command::WindowResponse;
            make_space(&self.buffer, &mut offset, OVERHEAD, self.mtu, output);
            offset += control.encode_header(&mut self.buffer[offset..]);
        }

        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.nocwnd {
            cwnd = self.cwnd.min(cwnd);
        }

        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };

            segment.conv = self.conv;
            segment.cmd = Command::Push;
            segment.wnd = wnd;
            segment.ts = current;
            segment.sn = self.snd_nxt;
            segment.una = self.rcv_nxt;
            segment.resendts = current;
            segment.rto = self.rx_rto;
            segment.fastack = 0;
            segment.xmit = 0;

            self.snd_nxt = self.snd_nxt.wrapping_add(1);

            self.snd_buf.push_back(segment);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };

        let rtomin = if self.nodelay == 0 { self.rx_rto >> 3 } else { 0 };

        for segment in self.snd_buf.iter_mut() {
            let mut needsend = false;

            if segment.xmit == 0 {
                // First transmission
                needsend = true;
                segment.xmit += 1;
                segment.rto = self.rx_rto;
                segment.resendts = current.wrapping_add(segment.rto.saturating_add(rtomin));
            } else if time_diff(current, segment.resendts) >= 0 {
                // RTO expired
                needsend = true;
                segment.xmit += 1;
                self.xmit += 1;

                if self.nodelay == 0 {
                    segment.rto = segment.rto.saturating_add(segment.rto.max(self.rx_rto));
                } else {
                    let step = if self.nodelay < 2 {
                        segment.rto
                    } else {
                        self.rx_rto
                    };
                    segment.rto = segment.rto.saturating_add(step / 2);
                }

                segment.resendts = current.wrapping_add(segment.rto);
                lost = true;
            } else if segment.fastack >= resent {
                // Fast retransmit
                if segment.xmit <= self.fastlimit || self.fastlimit == 0 {
                    needsend = true;
                    segment.xmit += 1;
                    segment.fastack = 0;
                    segment.resendts = current.wrapping_add(segment.rto);
                    change += 1;
                }
            }

            if needsend {
                segment.ts = current;
                segment.wnd = wnd;
                segment.una = self.rcv_nxt;

                let data_len = segment.data.len();

                make_space(&self.buffer, &mut offset, OVERHEAD + data_len, self.mtu, output);

                offset += segment.encode_header(&mut self.buffer[offset..]);
                self.buffer[offset..offset + data_len].copy_from_slice(&segment.data);
                offset += data_len;

                if segment.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if offset > 0 {
            output.output(&self.buffer[..offset]);
        }

        let mss = self.mss as u32;

        if change > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(mss);
        }

        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = mss;
        }

        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = mss;
        }
    }

    /// Advances the engine clock to `current` (milliseconds) and flushes if the flush interval
    /// has elapsed.
    pub fn update<O>(&mut self, current: u32, output: &mut O)
    where
        O: Output,
    {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);

        if slap >= FLUSH_SLAP_MAX || slap < -FLUSH_SLAP_MAX {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(output);
        }
    }

    /// Returns the time at which [`Arq::update`] should next be called, given the current time.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;

        let slap = time_diff(current, ts_flush);
        if slap >= FLUSH_SLAP_MAX || slap < -FLUSH_SLAP_MAX {
            ts_flush = current;
        }

        if time_diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = time_diff(ts_flush, current);
        let mut tm_packet = i32::MAX;

        for segment in self.snd_buf.iter() {
            let diff = time_diff(segment.resendts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = tm_packet.min(diff);
        }

        let minimal = (tm_packet.min(tm_flush) as u32).min(self.interval);

        current.wrapping_add(minimal)
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        assert!(
            mtu >= MTU_MIN && mtu > OVERHEAD,
            "mtu must be at least {} bytes",
            MTU_MIN
        );

        self.buffer = scratch_buffer(mtu);
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD;
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval.clamp(INTERVAL_MIN, INTERVAL_MAX);
    }

    /// `nodelay`: 0 = normal, 1 = no-delay, 2 = no-delay with gentler RTO backoff. \
    /// `resend`: fast retransmit ack-skip threshold, 0 disables. \
    /// `nocwnd`: disables the congestion window.
    pub fn set_nodelay(&mut self, nodelay: u32, interval: u32, resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay != 0 { RTO_NDL } else { RTO_MIN };
        self.set_interval(interval);
        self.fastresend = resend;
        self.nocwnd = nocwnd;
    }

    /// A size of zero leaves the corresponding window unchanged. The receive window is never
    /// smaller than [`WND_RCV`].
    pub fn set_window_size(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd.max(WND_RCV);
        }
    }

    pub fn set_dead_link(&mut self, dead_link: u32) {
        self.dead_link = dead_link;
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    pub fn rx_rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn dead_link(&self) -> u32 {
        self.dead_link
    }

    /// Returns true once any segment has been transmitted `dead_link` times without
    /// acknowledgement.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Number of segments sent but unacknowledged, plus those waiting to be sent.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Number of segments held across all four internal queues.
    pub fn total_queued(&self) -> usize {
        self.rcv_queue.len() + self.snd_queue.len() + self.rcv_buf.len() + self.snd_buf.len()
    }

    pub fn clear_send_queue(&mut self) {
        while let Some(segment) = self.snd_queue.pop_front() {
            self.pool.give(segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_engine() -> Arq {
        let mut arq = Arq::new(0);
        arq.set_nodelay(1, 10, 2, true);
        arq
    }

    fn update(arq: &mut Arq, now: u32) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        arq.update(now, &mut |bytes: &[u8]| datagrams.push(bytes.to_vec()));
        datagrams
    }

    fn flush(arq: &mut Arq) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        arq.flush(&mut |bytes: &[u8]| datagrams.push(bytes.to_vec()));
        datagrams
    }

    fn deliver(arq: &mut Arq, datagrams: &[Vec<u8>]) {
        for datagram in datagrams {
            arq.input(datagram).unwrap();
        }
    }

    fn receive_all(arq: &mut Arq) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut buffer = vec![0; 256 * 1024];
        while let Ok(len) = arq.receive(&mut buffer) {
            messages.push(buffer[..len].to_vec());
        }
        messages
    }

    fn commands(datagrams: &[Vec<u8>]) -> Vec<u8> {
        let mut cmds = Vec::new();
        for datagram in datagrams {
            let mut rd = Reader::new(datagram);
            while let Some(header) = Header::read(&mut rd) {
                cmds.push(header.cmd);
                rd.read_slice(header.len as usize).unwrap();
            }
        }
        cmds
    }

    #[test]
    fn basic_transfer() {
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(b"A").unwrap();
        a.send(b"B").unwrap();
        a.send(b"C").unwrap();

        let out = update(&mut a, 0);
        // Three small segments coalesce into one datagram
        assert_eq!(out.len(), 1);

        deliver(&mut b, &out);

        assert_eq!(b.peek_size(), Ok(1));
        assert_eq!(
            receive_all(&mut b),
            vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
        );

        // Acks flow back and clear the send buffer
        let acks = update(&mut b, 0);
        assert_eq!(commands(&acks), vec![82, 82, 82]);

        assert_eq!(a.wait_snd(), 3);
        deliver(&mut a, &acks);
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn congestion_window_growth_with_jumbo_mtu() {
        let mut a = new_engine();
        let mut b = new_engine();
        a.set_mtu(70_000);
        b.set_mtu(70_000);

        let mut received = Vec::new();

        for (i, now) in (0..10u8).zip((0..).step_by(20)) {
            a.send(&[i]).unwrap();

            let out = update(&mut a, now);
            deliver(&mut b, &out);
            received.extend(receive_all(&mut b));

            let acks = update(&mut b, now);
            deliver(&mut a, &acks);
        }

        assert_eq!(received, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(a.wait_snd(), 0);
        // Grew past the slow start threshold
        assert!(a.cwnd > a.ssthresh);
        assert!(a.incr >= 70_000 - OVERHEAD as u32);
    }

    #[test]
    fn fragmentation_round_trip() {
        let mut a = new_engine();
        let mut b = new_engine();

        let message = (0..5000).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        a.send(&message).unwrap();
        assert_eq!(a.wait_snd(), (5000 + a.mss() - 1) / a.mss());

        let out = update(&mut a, 0);
        assert!(out.iter().all(|datagram| datagram.len() <= a.mtu()));

        // Nothing is readable until every fragment has arrived
        deliver(&mut b, &out[..out.len() - 1]);
        assert_eq!(b.peek_size(), Err(RecvError::Incomplete));

        deliver(&mut b, &out[out.len() - 1..]);
        assert_eq!(b.peek_size(), Ok(5000));
        assert_eq!(receive_all(&mut b), vec![message]);
    }

    #[test]
    fn fragment_limit() {
        let mut a = new_engine();
        a.set_window_size(32, 1024);

        let mss = a.mss();

        // Exactly 255 fragments is allowed
        assert!(a.send(&vec![0; mss * 255]).is_ok());
        assert_eq!(a.wait_snd(), 255);

        let mut a = new_engine();
        a.set_window_size(32, 1024);

        assert_eq!(
            a.send(&vec![0; mss * 255 + 1]),
            Err(SendError::TooManyFragments {
                len: mss * 255 + 1,
                count: 256
            })
        );
        // Rejected before anything was queued
        assert_eq!(a.wait_snd(), 0);

        // The default receive window of 128 limits messages further
        let mut a = new_engine();
        assert_eq!(
            a.send(&vec![0; mss * 128]),
            Err(SendError::WindowTooSmall {
                count: 128,
                rcv_wnd: 128
            })
        );
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn receive_buffer_too_small() {
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(&[7; 100]).unwrap();
        deliver(&mut b, &update(&mut a, 0));

        let mut small = [0; 10];
        assert_eq!(
            b.receive(&mut small),
            Err(RecvError::BufferTooSmall {
                size: 100,
                capacity: 10
            })
        );

        // The message is still available
        let mut buffer = [0; 100];
        assert_eq!(b.receive(&mut buffer), Ok(100));
        assert_eq!(b.receive(&mut buffer), Err(RecvError::Empty));
    }

    #[test]
    fn duplicate_input() {
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(b"once").unwrap();

        let out = update(&mut a, 0);

        deliver(&mut b, &out);
        deliver(&mut b, &out);

        assert_eq!(receive_all(&mut b), vec![b"once".to_vec()]);

        // A duplicate arriving after the message was read is also dropped
        deliver(&mut b, &out);
        assert!(receive_all(&mut b).is_empty());
    }

    #[test]
    fn reordered_input() {
        let mut a = new_engine();
        a.set_mtu(64);
        let mut b = new_engine();

        for i in 0..10u8 {
            a.send(&[i; 30]).unwrap();
        }

        let out = update(&mut a, 0);
        assert_eq!(out.len(), 10);

        let reversed = out.iter().rev().cloned().collect::<Vec<_>>();
        deliver(&mut b, &reversed);

        let messages = receive_all(&mut b);
        assert_eq!(messages.len(), 10);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message, &vec![i as u8; 30]);
        }
    }

    #[test]
    fn retransmit_after_loss() {
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(b"lost").unwrap();

        // First transmission is dropped
        let out = update(&mut a, 0);
        assert_eq!(out.len(), 1);

        let mut now = 0;
        let mut resent = Vec::new();

        while resent.is_empty() {
            now += 10;
            assert!(now <= RTO_DEF + 10, "no retransmission");
            resent = update(&mut a, now);
        }

        deliver(&mut b, &resent);
        assert_eq!(receive_all(&mut b), vec![b"lost".to_vec()]);

        deliver(&mut a, &update(&mut b, now));
        assert_eq!(a.wait_snd(), 0);
        assert!(!a.is_dead());
    }

    #[test]
    fn dead_link() {
        let mut a = new_engine();
        a.set_dead_link(3);

        a.send(b"void").unwrap();

        let mut now = 0;
        while !a.is_dead() {
            update(&mut a, now);
            now += 10;
            assert!(now < 10_000, "dead link never detected");
        }

        // Nothing was ever acknowledged
        assert_eq!(a.wait_snd(), 1);
    }

    #[test]
    fn rejects_malformed_input() {
        let mut a = new_engine();
        let mut b = Arq::new(1);

        a.send(b"x").unwrap();
        let out = update(&mut a, 0);

        assert_eq!(
            b.input(&out[0]),
            Err(InputError::ConvMismatch {
                expected: 1,
                found: 0
            })
        );

        assert_eq!(b.input(&out[0][..10]), Err(InputError::Truncated));

        let mut b = new_engine();

        // Payload cut short
        let truncated = &out[0][..OVERHEAD];
        assert_eq!(
            b.input(truncated),
            Err(InputError::LengthOverflow {
                len: 1,
                remaining: 0
            })
        );

        let mut bad_command = out[0].clone();
        bad_command[4] = 99;
        assert_eq!(b.input(&bad_command), Err(InputError::UnknownCommand(99)));

        assert!(receive_all(&mut b).is_empty());
    }

    #[test]
    fn window_probe() {
        let mut a = new_engine();
        update(&mut a, 0);

        // Remote advertises a closed window
        let closed = Segment {
            cmd: Command::WindowResponse,
            wnd: 0,
            ..Default::default()
        };
        let mut datagram = [0; OVERHEAD];
        closed.encode_header(&mut datagram);
        a.input(&datagram).unwrap();

        // Probing begins after the initial backoff
        assert!(!commands(&update(&mut a, 10)).contains(&83));
        assert!(!commands(&update(&mut a, 5000)).contains(&83));
        assert!(commands(&update(&mut a, 7010)).contains(&83));

        // The next probe waits 1.5 times longer
        assert!(!commands(&update(&mut a, 7020)).contains(&83));
        assert!(!commands(&update(&mut a, 17000)).contains(&83));
        assert!(commands(&update(&mut a, 17520)).contains(&83));
    }

    #[test]
    fn window_probe_response() {
        let mut a = new_engine();
        update(&mut a, 0);

        let probe = Segment {
            cmd: Command::WindowProbe,
            wnd: 128,
            ..Default::default()
        };
        let mut datagram = [0; OVERHEAD];
        probe.encode_header(&mut datagram);
        a.input(&datagram).unwrap();

        assert_eq!(commands(&update(&mut a, 10)), vec![84]);
        // Answered once
        assert!(update(&mut a, 20).is_empty());
    }

    #[test]
    fn fast_retransmit() {
        let mut a = new_engine();
        a.set_mtu(64);
        let mut b = new_engine();

        for i in 0..4u8 {
            a.send(&[i; 30]).unwrap();
        }

        let out = update(&mut a, 0);
        assert_eq!(out.len(), 4);

        update(&mut b, 0);

        // Drop the first segment, deliver the rest one at a time so that each ack arrives in
        // its own datagram
        for datagram in &out[1..] {
            b.input(datagram).unwrap();
            deliver(&mut a, &flush(&mut b));
        }

        // Later acks reached the fast resend threshold, resend before the RTO expires
        let resent = update(&mut a, 10);
        assert_eq!(resent.len(), 1);

        deliver(&mut b, &resent);
        assert_eq!(receive_all(&mut b).len(), 4);
    }

    #[test]
    fn check_schedule() {
        let mut a = new_engine();

        // Not yet updated, call immediately
        assert_eq!(a.check(5), 5);

        update(&mut a, 0);
        assert_eq!(a.check(0), 10);

        a.send(b"x").unwrap();
        update(&mut a, 10);

        let next = a.check(11);
        assert!(next > 11 && next <= 20);
    }

    #[test]
    fn rto_estimate() {
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(b"ping").unwrap();
        deliver(&mut b, &update(&mut a, 1000));

        // Ack returns 50ms later
        let acks = update(&mut b, 1050);
        update(&mut a, 1050);
        deliver(&mut a, &acks);

        // srtt = 50, rttval = 25, rto = srtt + 4 * rttval
        assert_eq!(a.rx_rto(), 150);

        // Clamped to the no-delay minimum on a fast link
        let mut a = new_engine();
        let mut b = new_engine();

        a.send(b"ping").unwrap();
        deliver(&mut b, &update(&mut a, 1000));
        let acks = update(&mut b, 1000);
        update(&mut a, 1000);
        deliver(&mut a, &acks);

        assert_eq!(a.rx_rto(), RTO_NDL);
    }
}
