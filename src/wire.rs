/*!
Framing for the control connection. A request is a 5-character opcode line,
decimal ASCII header fields each ending in `\n`, then an optional payload of
exactly the declared length. A response is a `<length>\n` line (`-1` for
absent) followed by that many payload bytes. Item payloads carry a trailing
one-byte `'0'`/`'1'` scalar-vs-frozen marker, counted in the declared length.

Multi-item payloads (enqueue arrays, multi-item dequeue responses, heap
snapshots) use a frozen sequence: a big-endian `u32` slot count, then per
slot a big-endian `i32` length (`-1` = absent slot) and the slot's tagged
bytes. Item contents are never inspected - only the sequence structure is
parsed here.
*/

use crate::error::{QueueError, Result};
use crate::Item;
use byteorder::{BigEndian, ByteOrder};
use nix::errno::Errno;
use nix::unistd::{read, write};
use std::os::unix::io::RawFd;

/// Marker byte for a raw scalar payload.
pub const MARKER_BYTES: u8 = b'0';
/// Marker byte for a frozen (serialized structured) payload.
pub const MARKER_FROZEN: u8 = b'1';

const LF: u8 = b'\n';

/// The request opcodes of the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `W~QUE` - block the caller until pending drops to a threshold.
    Await,
    /// `C~QUE` - clear the queue.
    Clear,
    /// `E~QUE` - mark the queue ended.
    End,
    /// `A~QUE` - enqueue a frozen sequence to the normal lane.
    EnqueueSeq,
    /// `A~QUP` - enqueue a frozen sequence to a priority lane.
    EnqueueSeqP,
    /// `S~QUE` - enqueue one raw scalar to the normal lane.
    EnqueueRaw,
    /// `S~QUP` - enqueue one raw scalar to a priority lane.
    EnqueueRawP,
    /// `D~QUE` - blocking dequeue (the caller consumed a doorbell byte).
    Dequeue,
    /// `D~QUN` - non-blocking dequeue.
    DequeueNb,
    /// `N~QUE` - pending count.
    Pending,
    /// `I~QUE` - insert into the normal lane.
    Insert,
    /// `I~QUP` - insert into a priority lane.
    InsertP,
    /// `P~QUE` - peek the normal lane.
    Peek,
    /// `P~QUP` - peek a priority lane.
    PeekP,
    /// `P~QUH` - peek the heap.
    PeekHeap,
    /// `H~QUE` - full heap snapshot.
    Heap,
}

impl Opcode {
    pub fn tag(self) -> &'static [u8; 5] {
        match self {
            Opcode::Await => b"W~QUE",
            Opcode::Clear => b"C~QUE",
            Opcode::End => b"E~QUE",
            Opcode::EnqueueSeq => b"A~QUE",
            Opcode::EnqueueSeqP => b"A~QUP",
            Opcode::EnqueueRaw => b"S~QUE",
            Opcode::EnqueueRawP => b"S~QUP",
            Opcode::Dequeue => b"D~QUE",
            Opcode::DequeueNb => b"D~QUN",
            Opcode::Pending => b"N~QUE",
            Opcode::Insert => b"I~QUE",
            Opcode::InsertP => b"I~QUP",
            Opcode::Peek => b"P~QUE",
            Opcode::PeekP => b"P~QUP",
            Opcode::PeekHeap => b"P~QUH",
            Opcode::Heap => b"H~QUE",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Opcode> {
        match tag {
            b"W~QUE" => Some(Opcode::Await),
            b"C~QUE" => Some(Opcode::Clear),
            b"E~QUE" => Some(Opcode::End),
            b"A~QUE" => Some(Opcode::EnqueueSeq),
            b"A~QUP" => Some(Opcode::EnqueueSeqP),
            b"S~QUE" => Some(Opcode::EnqueueRaw),
            b"S~QUP" => Some(Opcode::EnqueueRawP),
            b"D~QUE" => Some(Opcode::Dequeue),
            b"D~QUN" => Some(Opcode::DequeueNb),
            b"N~QUE" => Some(Opcode::Pending),
            b"I~QUE" => Some(Opcode::Insert),
            b"I~QUP" => Some(Opcode::InsertP),
            b"P~QUE" => Some(Opcode::Peek),
            b"P~QUP" => Some(Opcode::PeekP),
            b"P~QUH" => Some(Opcode::PeekHeap),
            b"H~QUE" => Some(Opcode::Heap),
            _ => None,
        }
    }
}

/// Write the whole buffer, riding out EINTR and short writes. The fds are
/// blocking, so the loop always terminates or fails for real.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A buffered reader over a raw fd, sized for line-oriented frame headers.
/// EOF surfaces as [`QueueError::Orphaned`] - the peer hung up.
#[derive(Debug)]
pub struct SockReader {
    fd: RawFd,
    buf: Vec<u8>,
    start: usize,
}

impl SockReader {
    pub fn new(fd: RawFd) -> SockReader {
        SockReader {
            fd,
            buf: Vec::new(),
            start: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match read(self.fd, &mut chunk) {
                Ok(0) => return Err(QueueError::Orphaned),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    /// One header line, without the terminating `\n`.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf[self.start..].iter().position(|&c| c == LF) {
                let line = self.buf[self.start..self.start + pos].to_vec();
                self.start += pos + 1;
                self.compact();
                return Ok(line);
            }
            self.fill()?;
        }
    }

    /// Exactly `n` payload bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() - self.start < n {
            self.fill()?;
        }
        let out = self.buf[self.start..self.start + n].to_vec();
        self.start += n;
        self.compact();
        Ok(out)
    }
}

/// Parse a decimal ASCII header field. Anything else fails the call with a
/// user error naming the operation and argument.
pub fn parse_int(line: &[u8], op: &'static str, what: &'static str) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(QueueError::NotAnInteger { op, what })
}

/// An outgoing frame, assembled in memory and written with one syscall so a
/// frame is never interleaved with another writer's.
#[derive(Debug)]
pub struct FrameBuf {
    buf: Vec<u8>,
}

impl FrameBuf {
    pub fn request(op: Opcode, chn: u64, id: u64) -> FrameBuf {
        let mut f = FrameBuf { buf: Vec::with_capacity(64) };
        f.buf.extend_from_slice(op.tag());
        f.buf.push(LF);
        f.put_int(chn as i64);
        f.put_int(id as i64);
        f
    }

    pub fn put_int(&mut self, v: i64) {
        self.buf.extend_from_slice(v.to_string().as_bytes());
        self.buf.push(LF);
    }

    /// Length line plus the payload bytes themselves.
    pub fn put_blob(&mut self, payload: &[u8]) {
        self.put_int(payload.len() as i64);
        self.buf.extend_from_slice(payload);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// `-1\n`: the absent response.
pub fn respond_absent(fd: RawFd) -> Result<()> {
    write_all(fd, b"-1\n")
}

/// `<len>\n` plus the payload, in one write.
pub fn respond_payload(fd: RawFd, payload: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(LF);
    out.extend_from_slice(payload);
    write_all(fd, &out)
}

/// A bare decimal line (pending counts).
pub fn respond_int(fd: RawFd, v: i64) -> Result<()> {
    let mut out = v.to_string().into_bytes();
    out.push(LF);
    write_all(fd, &out)
}

/// The single `\n` sync byte acknowledging clear/end.
pub fn respond_sync(fd: RawFd) -> Result<()> {
    write_all(fd, b"\n")
}

/// Read a `-1`-or-length response and its payload.
pub fn read_response(rd: &mut SockReader, op: &'static str) -> Result<Option<Vec<u8>>> {
    let line = rd.read_line()?;
    let len = parse_int(&line, op, "length")?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(rd.read_exact(len as usize)?))
}

fn push_slot(out: &mut Vec<u8>, slot: Option<&Item>) {
    let mut len4 = [0u8; 4];
    match slot {
        None => {
            BigEndian::write_i32(&mut len4, -1);
            out.extend_from_slice(&len4);
        }
        Some(it) => {
            BigEndian::write_i32(&mut len4, it.payload().len() as i32 + 1);
            out.extend_from_slice(&len4);
            out.extend_from_slice(it.payload());
            out.push(it.marker());
        }
    }
}

/// Freeze a sequence of possibly-absent slots (dequeue responses).
pub fn freeze_seq(slots: &[Option<Item>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut len4 = [0u8; 4];
    BigEndian::write_u32(&mut len4, slots.len() as u32);
    out.extend_from_slice(&len4);
    for slot in slots {
        push_slot(&mut out, slot.as_ref());
    }
    out
}

/// Freeze a sequence of present items (enqueue arrays, multi-item inserts).
pub fn freeze_items(items: &[Item]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut len4 = [0u8; 4];
    BigEndian::write_u32(&mut len4, items.len() as u32);
    out.extend_from_slice(&len4);
    for it in items {
        push_slot(&mut out, Some(it));
    }
    out
}

/// Thaw a frozen sequence back into slots.
pub fn thaw_seq(buf: &[u8]) -> Result<Vec<Option<Item>>> {
    let mut pos = 0usize;
    let need = |pos: usize, n: usize| -> Result<()> {
        if buf.len() - pos < n {
            Err(QueueError::Wire("truncated sequence"))
        } else {
            Ok(())
        }
    };
    need(pos, 4)?;
    let count = BigEndian::read_u32(&buf[pos..]) as usize;
    pos += 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        need(pos, 4)?;
        let len = BigEndian::read_i32(&buf[pos..]);
        pos += 4;
        if len < 0 {
            out.push(None);
            continue;
        }
        let len = len as usize;
        need(pos, len)?;
        out.push(Some(Item::from_tagged(buf[pos..pos + len].to_vec())?));
        pos += len;
    }
    if pos != buf.len() {
        return Err(QueueError::Wire("trailing bytes after sequence"));
    }
    Ok(out)
}

/// Thaw a sequence that must not contain absent slots (enqueue payloads).
pub fn thaw_items(buf: &[u8]) -> Result<Vec<Item>> {
    thaw_seq(buf)?
        .into_iter()
        .map(|slot| slot.ok_or(QueueError::Wire("absent slot in enqueue sequence")))
        .collect()
}

/// Decode an insert payload: a raw scalar (marker `'0'`) is one item, a
/// frozen payload (marker `'1'`) is a sequence of them.
pub fn thaw_insert(payload: Vec<u8>) -> Result<Vec<Item>> {
    match Item::from_tagged(payload)? {
        Item::Bytes(b) => Ok(vec![Item::Bytes(b)]),
        Item::Frozen(seq) => thaw_items(&seq),
    }
}

/// Heap levels travel as decimal-ASCII byte strings inside the standard
/// sequence framing; integers stay ASCII on the wire.
pub fn freeze_levels(levels: &[i64]) -> Vec<u8> {
    let items: Vec<Item> = levels
        .iter()
        .map(|p| Item::Bytes(p.to_string().into_bytes()))
        .collect();
    freeze_items(&items)
}

pub fn thaw_levels(buf: &[u8]) -> Result<Vec<i64>> {
    thaw_items(buf)?
        .into_iter()
        .map(|it| parse_int(it.payload(), "heap", "level"))
        .collect()
}
