//! Typed views of the records found in a perf ring buffer.

use super::ring::PerfEventHeader;
use super::sys::*;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub ip: u64,
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub time: u64,
    pub cpu: u32,
    /// Group read frame words when the event samples with PERF_SAMPLE_READ.
    pub read: Vec<u64>,
    /// Callchain addresses, innermost first, context markers included.
    pub callchain: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MmapRecord {
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommRecord {
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub name: String,
    pub exec: bool,
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskRecord {
    pub pid: libc::pid_t,
    pub ppid: libc::pid_t,
    pub tid: libc::pid_t,
    pub ptid: libc::pid_t,
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchRecord {
    pub switch_out: bool,
    /// Thread switched to (on switch out) or from (on switch in), only for
    /// CPU-wide switch records.
    pub next_prev: Option<(libc::pid_t, libc::pid_t)>,
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub time: u64,
    pub cpu: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Sample(SampleRecord),
    Mmap(MmapRecord),
    Comm(CommRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Switch(SwitchRecord),
    Lost(u64),
    Other(u32),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Cursor { buf, pos }
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    /// `n` words, or None when fewer are left in the record.
    fn words(&mut self, n: usize) -> Option<Vec<u64>> {
        if n > self.buf.len().saturating_sub(self.pos) / 8 {
            return None;
        }
        (0..n).map(|_| self.u64()).collect()
    }

    /// NUL terminated string padded to 8 bytes; stops at `end`.
    fn string(&mut self, end: usize) -> Option<String> {
        let bytes = self.buf.get(self.pos..end)?;
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        let s = String::from_utf8_lossy(&bytes[..len]).into_owned();
        self.pos += (len + 1 + 7) & !7;
        Some(s)
    }
}

/// Trailing `sample_id` fields of non-sample records.
#[derive(Debug, Default, Clone, Copy)]
struct SampleId {
    pid: libc::pid_t,
    tid: libc::pid_t,
    time: Option<u64>,
    cpu: u32,
}

/// Knows the layout selected by the attribute that opened the event.
#[derive(Debug, Clone, Copy)]
pub struct RecordParser {
    sample_type: u64,
    sample_id_all: bool,
}

impl RecordParser {
    pub fn new(sample_type: u64, sample_id_all: bool) -> Self {
        RecordParser {
            sample_type,
            sample_id_all,
        }
    }

    fn has(&self, flag: u64) -> bool {
        self.sample_type & flag != 0
    }

    fn sample_id_size(&self) -> usize {
        if !self.sample_id_all {
            return 0;
        }
        [PERF_SAMPLE_TID, PERF_SAMPLE_TIME, PERF_SAMPLE_CPU]
            .iter()
            .filter(|f| self.has(**f))
            .count()
            * 8
    }

    fn sample_id(&self, body: &[u8]) -> (usize, SampleId) {
        let size = self.sample_id_size();
        if size == 0 || body.len() < size {
            return (body.len(), SampleId::default());
        }
        let start = body.len() - size;
        let mut cursor = Cursor::at(body, start);
        let mut id = SampleId::default();
        if self.has(PERF_SAMPLE_TID) {
            id.pid = cursor.i32().unwrap_or(-1);
            id.tid = cursor.i32().unwrap_or(-1);
        }
        if self.has(PERF_SAMPLE_TIME) {
            id.time = cursor.u64();
        }
        if self.has(PERF_SAMPLE_CPU) {
            id.cpu = cursor.u32().unwrap_or(0);
        }
        (start, id)
    }

    pub fn parse(&self, header: &PerfEventHeader, body: &[u8]) -> Option<Record> {
        match header.type_ {
            PERF_RECORD_SAMPLE => self.parse_sample(body).map(Record::Sample),
            PERF_RECORD_MMAP => {
                let (end, _) = self.sample_id(body);
                let mut c = Cursor::new(body);
                Some(Record::Mmap(MmapRecord {
                    pid: c.i32()?,
                    tid: c.i32()?,
                    addr: c.u64()?,
                    len: c.u64()?,
                    pgoff: c.u64()?,
                    filename: c.string(end)?,
                }))
            }
            PERF_RECORD_COMM => {
                let (end, id) = self.sample_id(body);
                let mut c = Cursor::new(body);
                Some(Record::Comm(CommRecord {
                    pid: c.i32()?,
                    tid: c.i32()?,
                    name: c.string(end)?,
                    exec: header.misc & PERF_RECORD_MISC_COMM_EXEC != 0,
                    time: id.time,
                }))
            }
            PERF_RECORD_FORK | PERF_RECORD_EXIT => {
                let mut c = Cursor::new(body);
                let task = TaskRecord {
                    pid: c.i32()?,
                    ppid: c.i32()?,
                    tid: c.i32()?,
                    ptid: c.i32()?,
                    time: c.u64()?,
                };
                if header.type_ == PERF_RECORD_FORK {
                    Some(Record::Fork(task))
                } else {
                    Some(Record::Exit(task))
                }
            }
            PERF_RECORD_SWITCH | PERF_RECORD_SWITCH_CPU_WIDE => {
                let (_, id) = self.sample_id(body);
                let next_prev = if header.type_ == PERF_RECORD_SWITCH_CPU_WIDE {
                    let mut c = Cursor::new(body);
                    Some((c.i32()?, c.i32()?))
                } else {
                    None
                };
                Some(Record::Switch(SwitchRecord {
                    switch_out: header.misc & PERF_RECORD_MISC_SWITCH_OUT != 0,
                    next_prev,
                    pid: id.pid,
                    tid: id.tid,
                    time: id.time?,
                    cpu: id.cpu,
                }))
            }
            PERF_RECORD_LOST => {
                let mut c = Cursor::new(body);
                let _id = c.u64()?;
                Some(Record::Lost(c.u64()?))
            }
            other => Some(Record::Other(other)),
        }
    }

    fn parse_sample(&self, body: &[u8]) -> Option<SampleRecord> {
        let mut c = Cursor::new(body);
        let mut sample = SampleRecord {
            ip: 0,
            pid: -1,
            tid: -1,
            time: 0,
            cpu: 0,
            read: Vec::new(),
            callchain: Vec::new(),
        };
        if self.has(PERF_SAMPLE_IP) {
            sample.ip = c.u64()?;
        }
        if self.has(PERF_SAMPLE_TID) {
            sample.pid = c.i32()?;
            sample.tid = c.i32()?;
        }
        if self.has(PERF_SAMPLE_TIME) {
            sample.time = c.u64()?;
        }
        if self.has(PERF_SAMPLE_CPU) {
            sample.cpu = c.u32()?;
            let _res = c.u32()?;
        }
        if self.has(PERF_SAMPLE_READ) {
            let nr = c.u64()?;
            let len = usize::try_from(nr).ok()?.checked_add(2)?;
            let mut frame = vec![nr];
            frame.extend(c.words(len)?);
            sample.read = frame;
        }
        if self.has(PERF_SAMPLE_CALLCHAIN) {
            let nr = c.u64()?;
            sample.callchain = c.words(usize::try_from(nr).ok()?)?;
        }
        Some(sample)
    }
}

/// User and kernel addresses of a callchain, outermost frame first, with the
/// context markers removed.
pub fn callchain_frames(callchain: &[u64]) -> impl Iterator<Item = u64> + '_ {
    callchain
        .iter()
        .rev()
        .copied()
        .filter(|ip| *ip < PERF_CONTEXT_MAX && *ip != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Body(Vec<u8>);

    impl Body {
        fn new() -> Self {
            Body(Vec::new())
        }
        fn u64(mut self, v: u64) -> Self {
            self.0.extend_from_slice(&v.to_ne_bytes());
            self
        }
        fn u32(mut self, v: u32) -> Self {
            self.0.extend_from_slice(&v.to_ne_bytes());
            self
        }
        fn string(mut self, s: &str) -> Self {
            let padded = (s.len() + 1 + 7) & !7;
            self.0.extend_from_slice(s.as_bytes());
            self.0.resize(self.0.len() + padded - s.len(), 0);
            self
        }
    }

    fn header(type_: u32, misc: u16) -> PerfEventHeader {
        PerfEventHeader {
            type_,
            misc,
            size: 0,
        }
    }

    const SAMPLE_TYPE: u64 = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;

    #[test]
    fn test_parse_sample_with_callchain() {
        let parser = RecordParser::new(SAMPLE_TYPE | PERF_SAMPLE_CALLCHAIN, true);
        let body = Body::new()
            .u64(0x4010)
            .u32(10)
            .u32(11)
            .u64(5000)
            .u32(3)
            .u32(0)
            .u64(3)
            .u64(PERF_CONTEXT_MAX + 0xe00)
            .u64(0x4010)
            .u64(0x4000);
        let Some(Record::Sample(sample)) = parser.parse(&header(PERF_RECORD_SAMPLE, 0), &body.0)
        else {
            panic!("expected sample");
        };
        assert_eq!(sample.ip, 0x4010);
        assert_eq!((sample.pid, sample.tid), (10, 11));
        assert_eq!(sample.time, 5000);
        assert_eq!(sample.cpu, 3);
        let frames: Vec<_> = callchain_frames(&sample.callchain).collect();
        assert_eq!(frames, vec![0x4000, 0x4010]);
    }

    #[test]
    fn test_parse_sample_read_frame() {
        let parser = RecordParser::new(PERF_SAMPLE_TIME | PERF_SAMPLE_READ, false);
        let body = Body::new()
            .u64(77)
            .u64(2)
            .u64(1000)
            .u64(900)
            .u64(5)
            .u64(6);
        let Some(Record::Sample(sample)) = parser.parse(&header(PERF_RECORD_SAMPLE, 0), &body.0)
        else {
            panic!("expected sample");
        };
        assert_eq!(sample.time, 77);
        assert_eq!(sample.read, vec![2, 1000, 900, 5, 6]);
    }

    #[test]
    fn test_parse_sample_rejects_corrupt_counts() {
        let parser = RecordParser::new(PERF_SAMPLE_TIME | PERF_SAMPLE_READ, false);
        let body = Body::new().u64(77).u64(u64::MAX).u64(1000).u64(900);
        assert_eq!(parser.parse(&header(PERF_RECORD_SAMPLE, 0), &body.0), None);

        // More members announced than the record holds.
        let body = Body::new().u64(77).u64(3).u64(1000).u64(900).u64(5);
        assert_eq!(parser.parse(&header(PERF_RECORD_SAMPLE, 0), &body.0), None);

        let parser = RecordParser::new(PERF_SAMPLE_IP | PERF_SAMPLE_CALLCHAIN, false);
        let body = Body::new().u64(0x4010).u64(u64::MAX - 1).u64(0x4010);
        assert_eq!(parser.parse(&header(PERF_RECORD_SAMPLE, 0), &body.0), None);
    }

    #[test]
    fn test_parse_mmap_and_comm() {
        let parser = RecordParser::new(SAMPLE_TYPE, true);
        let body = Body::new()
            .u32(10)
            .u32(10)
            .u64(0x7f00_0000_0000)
            .u64(0x1000)
            .u64(0x200)
            .string("/usr/lib/libc.so.6")
            .u32(10)
            .u32(10)
            .u64(42)
            .u32(1)
            .u32(0);
        let Some(Record::Mmap(mmap)) = parser.parse(&header(PERF_RECORD_MMAP, 0), &body.0) else {
            panic!("expected mmap");
        };
        assert_eq!(mmap.filename, "/usr/lib/libc.so.6");
        assert_eq!(mmap.pgoff, 0x200);

        let body = Body::new()
            .u32(10)
            .u32(12)
            .string("worker")
            .u32(10)
            .u32(12)
            .u64(43)
            .u32(1)
            .u32(0);
        let Some(Record::Comm(comm)) = parser.parse(
            &header(PERF_RECORD_COMM, PERF_RECORD_MISC_COMM_EXEC),
            &body.0,
        ) else {
            panic!("expected comm");
        };
        assert_eq!(comm.name, "worker");
        assert!(comm.exec);
        assert_eq!(comm.time, Some(43));
    }

    #[test]
    fn test_parse_cpu_wide_switch() {
        let parser = RecordParser::new(SAMPLE_TYPE, true);
        let body = Body::new()
            .u32(20)
            .u32(21)
            .u32(10)
            .u32(11)
            .u64(900)
            .u32(2)
            .u32(0);
        let Some(Record::Switch(switch)) = parser.parse(
            &header(PERF_RECORD_SWITCH_CPU_WIDE, PERF_RECORD_MISC_SWITCH_OUT),
            &body.0,
        ) else {
            panic!("expected switch");
        };
        assert!(switch.switch_out);
        assert_eq!(switch.next_prev, Some((20, 21)));
        assert_eq!(switch.tid, 11);
        assert_eq!(switch.time, 900);
        assert_eq!(switch.cpu, 2);
    }

    #[test]
    fn test_parse_lost() {
        let parser = RecordParser::new(SAMPLE_TYPE, true);
        let body = Body::new().u64(1).u64(17);
        assert_eq!(
            parser.parse(&header(PERF_RECORD_LOST, 0), &body.0),
            Some(Record::Lost(17))
        );
    }
}
