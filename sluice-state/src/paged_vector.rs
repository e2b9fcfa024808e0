use crate::error::{Result, SliceStoreError};
use crate::file::{FileReader, FileWriter};
use bincode::{Decode, Encode};
use sluice_types::{Buffer, BufferProvider, FileLayout, MemoryLayout};
use std::io::{Read, Write};

#[derive(Encode, Decode)]
struct PagedVectorHeader {
    number_of_tuples: u64,
    number_of_pages: u64,
}

/// Append-only container of fixed-size tuples stored in pages obtained from a
/// [`BufferProvider`]. Tuples never straddle pages.
pub struct PagedVector {
    layout: MemoryLayout,
    pages: Vec<Buffer>,
    number_of_tuples: u64,
    tuples_on_disk: u64,
}

impl PagedVector {
    pub fn new(layout: MemoryLayout) -> Result<Self> {
        if !layout.is_valid() {
            return Err(SliceStoreError::InvalidLayout(format!(
                "tuple size {} with key size {} does not fit pages of {} bytes",
                layout.tuple_size, layout.key_size, layout.page_size
            )));
        }

        Ok(Self {
            layout,
            pages: vec![],
            number_of_tuples: 0,
            tuples_on_disk: 0,
        })
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    fn capacity(&self) -> u64 {
        self.layout.capacity_per_page() as u64
    }

    pub fn append(&mut self, provider: &dyn BufferProvider, record: &[u8]) -> Result<()> {
        if record.len() != self.layout.tuple_size {
            return Err(SliceStoreError::InvalidRecord(format!(
                "expected {} bytes, got {}",
                self.layout.tuple_size,
                record.len()
            )));
        }

        let slot = (self.number_of_tuples % self.capacity()) as usize;
        if slot == 0 {
            let page = provider.get_unpooled_buffer(self.layout.page_size).ok_or(
                SliceStoreError::AllocationFailed {
                    size: self.layout.page_size,
                },
            )?;
            self.pages.push(page);
        }

        let Some(page) = self.pages.last_mut() else {
            return Err(SliceStoreError::Corrupted("paged vector has no pages".into()));
        };
        page.write_bytes(slot * self.layout.tuple_size, record)?;
        self.number_of_tuples += 1;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&[u8]> {
        if index >= self.number_of_tuples {
            return None;
        }
        let page = (index / self.capacity()) as usize;
        let slot = (index % self.capacity()) as usize;
        self.pages
            .get(page)?
            .bytes(slot * self.layout.tuple_size, self.layout.tuple_size)
            .ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.number_of_tuples).filter_map(|i| self.get(i))
    }

    /// Tuples currently held in memory.
    pub fn number_of_tuples(&self) -> u64 {
        self.number_of_tuples
    }

    pub fn tuples_on_disk(&self) -> u64 {
        self.tuples_on_disk
    }

    pub fn total_number_of_tuples(&self) -> u64 {
        self.number_of_tuples + self.tuples_on_disk
    }

    pub fn state_size_in_memory(&self) -> usize {
        self.pages.len() * self.layout.page_size
    }

    /// Appends every in-memory tuple to `writer` and frees the pages. Returns the number of
    /// tuple bytes written.
    pub fn write_to_file(&mut self, writer: &mut FileWriter, file_layout: FileLayout) -> Result<u64> {
        let key_size = self.layout.key_size;
        for tuple in self.iter() {
            match file_layout {
                FileLayout::NoSeparation => writer.write(tuple)?,
                FileLayout::SeparateKeys => {
                    writer.write_key(&tuple[..key_size])?;
                    writer.write(&tuple[key_size..])?;
                }
            }
        }
        writer.flush()?;

        let written = self.number_of_tuples * self.layout.tuple_size as u64;
        self.tuples_on_disk += self.number_of_tuples;
        self.number_of_tuples = 0;
        self.pages.clear();
        Ok(written)
    }

    /// Reads back every tuple previously written with [`PagedVector::write_to_file`] and
    /// appends it to the in-memory pages.
    pub fn read_from_file(
        &mut self,
        provider: &dyn BufferProvider,
        reader: &mut FileReader,
        file_layout: FileLayout,
    ) -> Result<()> {
        let key_size = self.layout.key_size;
        let mut tuple = vec![0u8; self.layout.tuple_size];

        for i in 0..self.tuples_on_disk {
            let complete = match file_layout {
                FileLayout::NoSeparation => reader.read(&mut tuple)? == tuple.len(),
                FileLayout::SeparateKeys => {
                    let (key, value) = tuple.split_at_mut(key_size);
                    reader.read_key(key)? == key.len() && reader.read(value)? == value.len()
                }
            };
            if !complete {
                return Err(SliceStoreError::Corrupted(format!(
                    "spill file ended after {} of {} tuples",
                    i, self.tuples_on_disk
                )));
            }
            self.append(provider, &tuple)?;
        }

        self.tuples_on_disk = 0;
        Ok(())
    }

    /// Writes the tuple count followed by the raw bytes of every page.
    pub fn write_pages(&self, mut out: &mut dyn Write) -> Result<()> {
        if self.tuples_on_disk > 0 {
            return Err(SliceStoreError::Precondition(format!(
                "cannot serialize a paged vector with {} tuples on disk",
                self.tuples_on_disk
            )));
        }

        let header = PagedVectorHeader {
            number_of_tuples: self.number_of_tuples,
            number_of_pages: self.pages.len() as u64,
        };
        bincode::encode_into_std_write(header, &mut out, bincode::config::standard())?;
        for page in &self.pages {
            out.write_all(page.as_slice())
                .map_err(|e| SliceStoreError::io("<stream>", e))?;
        }
        Ok(())
    }

    /// Replaces the contents with pages read from `input`.
    pub fn read_pages(
        &mut self,
        provider: &dyn BufferProvider,
        mut input: &mut dyn Read,
    ) -> Result<()> {
        let header: PagedVectorHeader =
            bincode::decode_from_std_read(&mut input, bincode::config::standard())?;

        let expected_pages = header.number_of_tuples.div_ceil(self.capacity());
        if expected_pages != header.number_of_pages {
            return Err(SliceStoreError::Corrupted(format!(
                "{} tuples cannot span {} pages",
                header.number_of_tuples, header.number_of_pages
            )));
        }

        let mut pages = Vec::with_capacity(header.number_of_pages as usize);
        for _ in 0..header.number_of_pages {
            let mut page = provider.get_unpooled_buffer(self.layout.page_size).ok_or(
                SliceStoreError::AllocationFailed {
                    size: self.layout.page_size,
                },
            )?;
            input
                .read_exact(page.as_mut_slice())
                .map_err(|e| SliceStoreError::io("<stream>", e))?;
            pages.push(page);
        }

        self.pages = pages;
        self.number_of_tuples = header.number_of_tuples;
        self.tuples_on_disk = 0;
        Ok(())
    }
}
