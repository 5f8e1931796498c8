//! A data ring paired with a header ring.
//!
//! Every transfer on the data ring is described by one header slot on the
//! header ring, which lives at the next key up. A writer publishes the
//! header, then streams the data; a reader opens the header, then reads the
//! data to its end.

use crate::error::HduError;
use crate::header::{AsciiHeader, HDR_SIZE};
use sluice_ipc::{Key, OpenMode, Ring, RingConfig, RingError, ShmNamespace, Stream};

/// A header plus data unit.
///
/// Created detached; [`HeaderDataUnit::connect`] attaches both rings.
#[derive(Debug)]
pub struct HeaderDataUnit {
    ns: ShmNamespace,
    data_key: Key,
    header_key: Key,
    conn: Option<Connection>,
}

#[derive(Debug)]
struct Connection {
    data: Stream,
    header: Ring,
    /// Parsed copy of the header slot currently held.
    current: Option<AsciiHeader>,
    /// The header slot has been taken from the ring and not cleared.
    held: bool,
}

impl HeaderDataUnit {
    /// A unit at the default key.
    pub fn new(ns: ShmNamespace) -> Self {
        Self::with_key(ns, Key::DEFAULT)
    }

    pub fn with_key(ns: ShmNamespace, key: Key) -> Self {
        Self {
            ns,
            data_key: key,
            header_key: key.next(),
            conn: None,
        }
    }

    /// Retargets a detached unit. The header ring follows at `key.next()`.
    pub fn set_key(&mut self, key: Key) -> Result<(), HduError> {
        if self.conn.is_some() {
            return Err(HduError::AlreadyConnected { key: self.data_key });
        }
        self.data_key = key;
        self.header_key = key.next();
        Ok(())
    }

    pub fn data_key(&self) -> Key {
        self.data_key
    }

    pub fn header_key(&self) -> Key {
        self.header_key
    }

    /// Creates both rings of a unit at `key`. If the header ring cannot be
    /// created the data ring is destroyed again.
    pub fn create_rings(
        ns: &ShmNamespace,
        key: Key,
        data: RingConfig,
        header: RingConfig,
    ) -> Result<(), HduError> {
        let data_ring = Ring::create(ns, key, data)?;
        match Ring::create(ns, key.next(), header) {
            Ok(_) => {
                tracing::info!(%key, "created header and data rings");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = data_ring.destroy() {
                    tracing::warn!(%key, error = %cleanup, "could not remove data ring");
                }
                Err(e.into())
            }
        }
    }

    /// Destroys both rings of the unit at `key`, attempting each even if the
    /// other fails.
    pub fn destroy_rings(ns: &ShmNamespace, key: Key) -> Result<(), HduError> {
        let errors: Vec<RingError> = [key, key.next()]
            .into_iter()
            .filter_map(|k| Ring::destroy_key(ns, k).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HduError::Teardown { key, errors })
        }
    }

    /// Attaches to the header ring and then the data ring.
    pub fn connect(&mut self) -> Result<(), HduError> {
        if self.conn.is_some() {
            return Err(HduError::AlreadyConnected { key: self.data_key });
        }
        let header = Ring::connect(&self.ns, self.header_key)?;
        let data = Stream::new(Ring::connect(&self.ns, self.data_key)?);
        self.conn = Some(Connection {
            data,
            header,
            current: None,
            held: false,
        });
        tracing::debug!(key = %self.data_key, "unit connected");
        Ok(())
    }

    /// Detaches both rings, releasing any role held on either.
    pub fn disconnect(&mut self) -> Result<(), HduError> {
        let conn = self.conn.take().ok_or(HduError::NotConnected { key: self.data_key })?;
        let mut errors = Vec::new();
        if let Err(e) = conn.data.into_ring().disconnect() {
            errors.push(e);
        }
        if let Err(e) = conn.header.disconnect() {
            errors.push(e);
        }
        if errors.is_empty() {
            tracing::debug!(key = %self.data_key, "unit disconnected");
            Ok(())
        } else {
            Err(HduError::Teardown {
                key: self.data_key,
                errors,
            })
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&mut self) -> Result<&mut Connection, HduError> {
        let key = self.data_key;
        self.conn.as_mut().ok_or(HduError::NotConnected { key })
    }

    /// Claims a reader identity on the header ring and opens the data ring
    /// for reading.
    pub fn lock_read(&mut self) -> Result<(), HduError> {
        let conn = self.conn()?;
        conn.header.lock_read()?;
        if let Err(e) = conn.data.open(OpenMode::Read) {
            if let Err(unlock) = conn.header.unlock_read() {
                tracing::warn!(error = %unlock, "could not release header reader identity");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes the data stream, clears any header still held and releases
    /// the header identity.
    pub fn unlock_read(&mut self) -> Result<(), HduError> {
        let conn = self.conn()?;
        conn.data.close()?;
        conn.release_header()?;
        conn.header.unlock_read()?;
        Ok(())
    }

    /// Takes the writer permit on both rings. The data transfer starts with
    /// the first byte written.
    pub fn lock_write(&mut self) -> Result<(), HduError> {
        self.lock_write_with(OpenMode::WriteImmediate)
    }

    /// Like [`HeaderDataUnit::lock_write`], opening the data stream in
    /// `mode`. [`OpenMode::Write`] clocks data until
    /// [`Stream::start`] names the first byte.
    pub fn lock_write_with(&mut self, mode: OpenMode) -> Result<(), HduError> {
        let conn = self.conn()?;
        conn.header.lock_write()?;
        if let Err(e) = conn.data.open(mode) {
            if let Err(unlock) = conn.header.unlock_write() {
                tracing::warn!(error = %unlock, "could not release header writer permit");
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn unlock_write(&mut self) -> Result<(), HduError> {
        let conn = self.conn()?;
        if conn.data.is_open() {
            conn.data.close()?;
        }
        conn.header.unlock_write()?;
        Ok(())
    }

    /// Opens the data ring as a passive viewer.
    pub fn open_view(&mut self) -> Result<(), HduError> {
        self.conn()?.data.open(OpenMode::View)?;
        Ok(())
    }

    pub fn close_view(&mut self) -> Result<(), HduError> {
        let conn = self.conn()?;
        conn.data.close()?;
        conn.release_header()?;
        Ok(())
    }

    /// Waits for the next header and returns it.
    ///
    /// Empty header slots are cleared and skipped when they end a header
    /// transfer. A header without `HDR_SIZE` gets one equal to the slot
    /// size; a smaller `HDR_SIZE` truncates the header.
    ///
    /// # Errors
    /// [`HduError::HeaderTooLarge`] if `HDR_SIZE` exceeds the slot size.
    pub fn open_header(&mut self) -> Result<&AsciiHeader, HduError> {
        let conn = self.conn()?;
        conn.release_header()?;

        let slot = loop {
            match conn.header.next_read()? {
                Some(slot) if slot.len > 0 => break slot,
                Some(_) => {
                    conn.held = true;
                    conn.release_header()?;
                    if !conn.header.eod() {
                        tracing::error!("empty header slot inside a header transfer");
                        return Err(HduError::EmptyHeader);
                    }
                    conn.header.reset()?;
                }
                None => conn.header.reset()?,
            }
        };
        conn.held = true;

        let slot_size = conn.header.bufsz();
        let raw = conn.header.slot(slot.index);
        let mut header = AsciiHeader::parse(raw);
        let hdr_size = match header.get(HDR_SIZE) {
            None => {
                tracing::warn!(slot_size, "header has no {HDR_SIZE}, assuming the slot size");
                header.set(HDR_SIZE, slot_size);
                slot_size
            }
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| HduError::BadHdrSize(v.to_string()))?,
        };
        if hdr_size > slot_size {
            tracing::error!(hdr_size, slot_size, "header larger than its slot");
            return Err(HduError::HeaderTooLarge {
                hdr_size,
                slot: slot_size,
            });
        }
        if hdr_size < slot_size {
            header = AsciiHeader::parse(&raw[..hdr_size as usize]);
            if header.get(HDR_SIZE).is_none() {
                header.set(HDR_SIZE, hdr_size);
            }
        }

        tracing::debug!(hdr_size, entries = header.len(), "opened header");
        Ok(conn.current.insert(header))
    }

    /// The header returned by the last [`HeaderDataUnit::open_header`].
    pub fn header(&self) -> Option<&AsciiHeader> {
        self.conn.as_ref()?.current.as_ref()
    }

    /// Publishes `header` in the next header slot. `HDR_SIZE` defaults to
    /// the header slot size.
    pub fn write_header(&mut self, header: &AsciiHeader) -> Result<(), HduError> {
        let conn = self.conn()?;
        let slot_size = conn.header.bufsz();

        let mut header = header.clone();
        if header.get(HDR_SIZE).is_none() {
            header.set(HDR_SIZE, slot_size);
        }

        let index = conn.header.next_write()?;
        header.write_into(conn.header.slot_mut(index))?;
        conn.header.mark_filled(slot_size)?;
        tracing::debug!(key = %self.data_key, entries = header.len(), "wrote header");
        Ok(())
    }

    /// The data stream.
    pub fn data(&mut self) -> Result<&mut Stream, HduError> {
        Ok(&mut self.conn()?.data)
    }

    pub fn header_ring(&self) -> Option<&Ring> {
        self.conn.as_ref().map(|c| &c.header)
    }
}

impl Connection {
    /// Clears the held header slot when this handle is a header reader.
    fn release_header(&mut self) -> Result<(), RingError> {
        if self.held {
            self.held = false;
            self.current = None;
            if self.header.is_reader() {
                self.header.mark_cleared()?;
            }
        }
        Ok(())
    }
}
