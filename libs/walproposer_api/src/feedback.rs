//! Feedback carried back from acceptors to the proposer on every `AppendResponse`:
//! hot-standby feedback (fixed layout) and an extensible pageserver feedback block.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

pub type TimestampTz = i64;
pub type FullTransactionId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HotStandbyFeedback {
    pub ts: TimestampTz,
    pub xmin: FullTransactionId,
    pub catalog_xmin: FullTransactionId,
}

impl HotStandbyFeedback {
    pub fn empty() -> HotStandbyFeedback {
        HotStandbyFeedback {
            ts: 0,
            xmin: 0,
            catalog_xmin: 0,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.ts);
        buf.put_u64_le(self.xmin);
        buf.put_u64_le(self.catalog_xmin);
    }

    pub fn from_bytes(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 24 {
            bail!("HotStandbyFeedback is incomplete");
        }
        Ok(HotStandbyFeedback {
            ts: buf.get_i64_le(),
            xmin: buf.get_u64_le(),
            catalog_xmin: buf.get_u64_le(),
        })
    }
}

/// Recognized pageserver feedback keys. Anything else is skipped by its declared
/// length so the wire format stays forward compatible (spec P8).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageserverFeedback {
    pub current_timeline_size: Option<u64>,
    pub last_received_lsn: Option<Lsn>,
    pub disk_consistent_lsn: Option<Lsn>,
    pub remote_consistent_lsn: Option<Lsn>,
    pub replytime: Option<TimestampTz>,
}

impl PageserverFeedback {
    pub fn empty() -> PageserverFeedback {
        PageserverFeedback::default()
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        let mut entries: Vec<(&str, Vec<u8>)> = Vec::new();
        if let Some(v) = self.current_timeline_size {
            entries.push(("current_timeline_size", v.to_le_bytes().to_vec()));
        }
        if let Some(v) = self.last_received_lsn {
            entries.push(("ps_writelsn", u64::from(v).to_le_bytes().to_vec()));
        }
        if let Some(v) = self.disk_consistent_lsn {
            entries.push(("ps_flushlsn", u64::from(v).to_le_bytes().to_vec()));
        }
        if let Some(v) = self.remote_consistent_lsn {
            entries.push(("ps_applylsn", u64::from(v).to_le_bytes().to_vec()));
        }
        if let Some(v) = self.replytime {
            entries.push(("ps_replytime", v.to_le_bytes().to_vec()));
        }

        buf.put_u8(entries.len() as u8);
        for (key, val) in entries {
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_u32_le(val.len() as u32);
            buf.put_slice(&val);
        }
    }

    pub fn from_bytes(buf: &mut impl Buf) -> Result<Self> {
        let mut res = PageserverFeedback::empty();
        if !buf.has_remaining() {
            return Ok(res);
        }
        let nkeys = buf.get_u8();
        for _ in 0..nkeys {
            let key = read_cstr(buf)?;
            if buf.remaining() < 4 {
                bail!("pageserver feedback value length is missing");
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                bail!("pageserver feedback value is truncated");
            }
            let mut value = vec![0u8; len];
            buf.copy_to_slice(&mut value);

            match key.as_str() {
                "current_timeline_size" => {
                    res.current_timeline_size = Some(u64::from_le_bytes(value.try_into().unwrap()));
                }
                "ps_writelsn" | "last_received_lsn" => {
                    res.last_received_lsn = Some(Lsn(u64::from_le_bytes(value.try_into().unwrap())));
                }
                "ps_flushlsn" | "disk_consistent_lsn" => {
                    res.disk_consistent_lsn = Some(Lsn(u64::from_le_bytes(value.try_into().unwrap())));
                }
                "ps_applylsn" | "remote_consistent_lsn" => {
                    res.remote_consistent_lsn = Some(Lsn(u64::from_le_bytes(value.try_into().unwrap())));
                }
                "ps_replytime" | "replytime" => {
                    res.replytime = Some(i64::from_le_bytes(value.try_into().unwrap()));
                }
                _ => {
                    // unknown key: skip by length, already consumed above.
                }
            }
        }
        Ok(res)
    }

    /// Merge in the freshest values from another snapshot (used when several acceptors
    /// report feedback and we keep only the most advanced one per field).
    pub fn merge_max(&mut self, other: &PageserverFeedback) {
        merge_max_opt(&mut self.current_timeline_size, other.current_timeline_size);
        merge_max_opt(&mut self.last_received_lsn, other.last_received_lsn);
        merge_max_opt(&mut self.disk_consistent_lsn, other.disk_consistent_lsn);
        merge_max_opt(&mut self.remote_consistent_lsn, other.remote_consistent_lsn);
        if let Some(o) = other.replytime {
            if self.replytime.is_none_or_less(o) {
                self.replytime = Some(o);
            }
        }
    }
}

fn merge_max_opt<T: Ord + Copy>(slot: &mut Option<T>, other: Option<T>) {
    if let Some(o) = other {
        match slot {
            Some(cur) if *cur >= o => {}
            _ => *slot = Some(o),
        }
    }
}

trait IsNoneOrLess {
    fn is_none_or_less(&self, other: TimestampTz) -> bool;
}
impl IsNoneOrLess for Option<TimestampTz> {
    fn is_none_or_less(&self, other: TimestampTz) -> bool {
        match self {
            None => true,
            Some(v) => *v < other,
        }
    }
}

fn read_cstr(buf: &mut impl Buf) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        if !buf.has_remaining() {
            bail!("pageserver feedback key missing NUL terminator");
        }
        let b = buf.get_u8();
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8(bytes)?)
}
