//! Sectioned container shared by `manifest.bin` and `addresses.bin`.
//!
//! Both files open with the same header (magic, version, byte order) and
//! then carry tagged, length-prefixed sections. Readers skip sections they
//! do not recognize.

use std::io::{self, Read, Seek, SeekFrom, Write};

use cryo_types::RawHandle;
use tracing::warn;

use crate::error::{CaptureError, Result};
use crate::format::{SectionId, LITTLE_ENDIAN, MAGIC, VERSION};
use crate::record::RestoreObjectRecord;
use crate::wire::{ReadLe, WriteLe};

struct SectionWriter<W: Write + Seek> {
    out: W,
}

impl<W: Write + Seek> SectionWriter<W> {
    fn new(mut out: W) -> Result<Self> {
        out.write_all(&MAGIC)?;
        out.write_u16_le(VERSION)?;
        out.write_u8(LITTLE_ENDIAN)?;
        Ok(Self { out })
    }

    /// Writes one section, backpatching its length once `f` has run.
    fn section<F>(&mut self, id: SectionId, f: F) -> Result<()>
    where
        F: FnOnce(&mut W) -> Result<()>,
    {
        self.out.write_u32_le(id.0)?;
        let len_at = self.out.stream_position()?;
        self.out.write_u64_le(0)?;
        f(&mut self.out)?;
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(len_at))?;
        self.out.write_u64_le(end - (len_at + 8))?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

struct SectionReader<R: Read> {
    input: R,
}

impl<R: Read> SectionReader<R> {
    fn new(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| CaptureError::InvalidMagic)?;
        if magic != MAGIC {
            return Err(CaptureError::InvalidMagic);
        }
        let version = input.read_u16_le()?;
        if version != VERSION {
            return Err(CaptureError::UnsupportedVersion(version));
        }
        let endian = input.read_u8()?;
        if endian != LITTLE_ENDIAN {
            return Err(CaptureError::InvalidEndianness(endian));
        }
        Ok(Self { input })
    }

    /// Returns the next section header, or `None` at end of file.
    fn next_section(&mut self) -> Result<Option<(SectionId, u64)>> {
        let mut buf = [0u8; 4];
        match self.input.read_exact(&mut buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let id = SectionId(u32::from_le_bytes(buf));
        let len = self.input.read_u64_le()?;
        Ok(Some((id, len)))
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        let copied = io::copy(&mut self.input.by_ref().take(len), &mut io::sink())?;
        if copied != len {
            return Err(CaptureError::Corrupt("truncated section"));
        }
        Ok(())
    }
}

pub fn write_manifest<W: Write + Seek>(
    out: W,
    records: &[RestoreObjectRecord],
) -> Result<()> {
    let count = u32::try_from(records.len())
        .map_err(|_| CaptureError::Corrupt("too many objects for one manifest"))?;
    let mut w = SectionWriter::new(out)?;
    w.section(SectionId::OBJECTS, |out| {
        out.write_u32_le(count)?;
        for record in records {
            record.write_to(out)?;
        }
        Ok(())
    })?;
    w.finish()
}

/// Reads the object records back in their stored (dependency) order.
pub fn read_manifest<R: Read>(input: R) -> Result<Vec<RestoreObjectRecord>> {
    let mut r = SectionReader::new(input)?;
    let mut records: Option<Vec<RestoreObjectRecord>> = None;
    while let Some((id, len)) = r.next_section()? {
        match id {
            SectionId::OBJECTS => {
                if records.is_some() {
                    warn!("duplicate objects section, keeping the later one");
                }
                let mut section = r.input.by_ref().take(len);
                let count = section.read_u32_le()?;
                let mut out = Vec::new();
                for _ in 0..count {
                    out.push(RestoreObjectRecord::read_from(&mut section)?);
                }
                // Tolerate trailing bytes a newer writer may have appended.
                io::copy(&mut section, &mut io::sink())?;
                records = Some(out);
            }
            other => {
                warn!(section = %other, "skipping unknown manifest section");
                r.skip(len)?;
            }
        }
    }
    records.ok_or(CaptureError::Corrupt("manifest has no objects section"))
}

pub fn write_addresses<W: Write + Seek>(out: W, addresses: &[(RawHandle, u64)]) -> Result<()> {
    let count = u32::try_from(addresses.len())
        .map_err(|_| CaptureError::Corrupt("too many addresses for one table"))?;
    let mut w = SectionWriter::new(out)?;
    w.section(SectionId::ADDRESSES, |out| {
        out.write_u32_le(count)?;
        for &(handle, address) in addresses {
            out.write_u64_le(handle.0)?;
            out.write_u64_le(address)?;
        }
        Ok(())
    })?;
    w.finish()
}

/// Reads the captured device addresses, keyed by captured handle.
pub fn read_addresses<R: Read>(input: R) -> Result<Vec<(RawHandle, u64)>> {
    let mut r = SectionReader::new(input)?;
    let mut addresses: Option<Vec<(RawHandle, u64)>> = None;
    while let Some((id, len)) = r.next_section()? {
        match id {
            SectionId::ADDRESSES => {
                if addresses.is_some() {
                    warn!("duplicate addresses section, keeping the later one");
                }
                let mut section = r.input.by_ref().take(len);
                let count = section.read_u32_le()?;
                let mut out = Vec::new();
                for _ in 0..count {
                    let handle = RawHandle(section.read_u64_le()?);
                    let address = section.read_u64_le()?;
                    out.push((handle, address));
                }
                io::copy(&mut section, &mut io::sink())?;
                addresses = Some(out);
            }
            other => {
                warn!(section = %other, "skipping unknown address section");
                r.skip(len)?;
            }
        }
    }
    addresses.ok_or(CaptureError::Corrupt("address table has no addresses section"))
}
