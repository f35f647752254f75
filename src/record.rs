// --- Trade record type and binary serialization ---

use std::cmp::Ordering;
use std::io::{self, Read, Write};

/// A single parsed trade: source-assigned receive timestamp and price.
///
/// This is the unit that flows through the whole pipeline, so it is kept
/// `Copy` and exactly 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeRecord {
    pub receive_ts: u64,
    pub price: f64,
}

/// On-disk size of one serialized record.
pub const RECORD_SIZE: usize = 16;

/// Orders records by receive timestamp. Records sharing a timestamp
/// compare equal; their relative order is not specified.
pub fn by_receive_ts(a: &TradeRecord, b: &TradeRecord) -> Ordering {
    a.receive_ts.cmp(&b.receive_ts)
}

/// Fixed-width binary codec for a record type.
///
/// The external sorter is parameterised over this trait so the spill and
/// merge machinery stays independent of the record layout.
pub trait Serializer<T>: Send + Sync {
    fn write<W: Write + ?Sized>(&self, sink: &mut W, value: &T) -> io::Result<()>;
    fn read<R: Read + ?Sized>(&self, source: &mut R) -> io::Result<T>;
}

/// Little-endian codec for `TradeRecord`: 8 bytes timestamp, 8 bytes price.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeSerializer;

impl Serializer<TradeRecord> for TradeSerializer {
    fn write<W: Write + ?Sized>(&self, sink: &mut W, value: &TradeRecord) -> io::Result<()> {
        sink.write_all(&value.receive_ts.to_le_bytes())?;
        sink.write_all(&value.price.to_le_bytes())
    }

    fn read<R: Read + ?Sized>(&self, source: &mut R) -> io::Result<TradeRecord> {
        let mut ts_buf = [0u8; 8];
        let mut price_buf = [0u8; 8];
        source.read_exact(&mut ts_buf)?;
        source.read_exact(&mut price_buf)?;
        Ok(TradeRecord {
            receive_ts: u64::from_le_bytes(ts_buf),
            price: f64::from_le_bytes(price_buf),
        })
    }
}
