use crate::minidump::Location;
use std::{
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    marker::PhantomData as PD,
};

pub struct Reservation {
    pos: u64,
    size: u64,
}

impl From<&Reservation> for Location {
    #[inline]
    fn from(res: &Reservation) -> Self {
        Self {
            data_size: res.size as u32,
            rva: res.pos as u32,
        }
    }
}

/// Writes the dump file as a sequence of reservations.
///
/// Streams and directory entries refer to each other by file offset, so
/// space for every record is claimed up front and filled in later, once the
/// offsets it points at are known. The file is grown with `ftruncate` in
/// page sized steps and trimmed back to the written length at the end.
pub struct FileWriter<'file> {
    inner: &'file mut File,
    page_size: u64,
    pos: u64,
    len: u64,
}

impl<'file> FileWriter<'file> {
    pub fn new(file: &'file mut File) -> Self {
        Self {
            inner: file,
            page_size: crate::utils::page_size() as u64,
            pos: 0,
            len: 0,
        }
    }

    /// Offset the next reservation will start at
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn reserve_raw(&mut self, size: u64) -> io::Result<Reservation> {
        let unwritten = self.len - self.pos;
        if unwritten < size {
            // Grow in page sizes
            let num_pages = (size - unwritten) / self.page_size + 1;

            let new_len = self.len + num_pages * self.page_size;
            self.inner.set_len(new_len)?;

            self.len = new_len;
        }

        let pos = self.pos;
        self.pos += size;

        Ok(Reservation { pos, size })
    }

    #[inline]
    pub fn reserve<Kind: Sized>(&mut self) -> io::Result<MDItem<Kind>> {
        let reservation = self.reserve_raw(std::mem::size_of::<Kind>() as u64)?;

        Ok(MDItem {
            reservation,
            _kind: PD,
        })
    }

    #[inline]
    pub fn reserve_array<Kind: Sized>(&mut self, count: usize) -> io::Result<MDArray<Kind>> {
        let reservation = self.reserve_raw((std::mem::size_of::<Kind>() * count) as u64)?;
        Ok(MDArray {
            reservation,
            _kind: PD,
        })
    }

    /// Reserves a `count`-element array prefixed with `Header`, the layout
    /// of the list streams
    #[inline]
    pub fn reserve_header_array<Header: Sized, Kind: Sized>(
        &mut self,
        count: usize,
    ) -> io::Result<MDHeaderArray<Header, Kind>> {
        let to_reserve = std::mem::size_of::<Header>() + std::mem::size_of::<Kind>() * count;
        let reservation = self.reserve_raw(to_reserve as u64)?;

        Ok(MDHeaderArray {
            reservation,
            _header: PD,
            _kind: PD,
        })
    }

    /// Reserves room for `bytes` and writes them immediately
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<Location> {
        let reservation = self.reserve_raw(bytes.len() as u64)?;

        self.inner.seek(SeekFrom::Start(reservation.pos))?;
        self.inner.write_all(bytes)?;

        Ok(Location::from(&reservation))
    }

    /// Writes a `MINIDUMP_STRING`, a byte length followed by UTF-16LE
    /// units. Encoding goes through an inline buffer, never the heap.
    pub fn write_string(&mut self, s: &str) -> io::Result<Location> {
        let units = s.encode_utf16().count() as u64;
        let reservation = self.reserve_raw(4 + units * 2)?;

        self.inner.seek(SeekFrom::Start(reservation.pos))?;
        self.inner.write_all(&((units * 2) as u32).to_le_bytes())?;

        let mut buf = [0u8; 128];
        let mut used = 0;

        for unit in s.encode_utf16() {
            buf[used..used + 2].copy_from_slice(&unit.to_le_bytes());
            used += 2;

            if used == buf.len() {
                self.inner.write_all(&buf)?;
                used = 0;
            }
        }

        if used > 0 {
            self.inner.write_all(&buf[..used])?;
        }

        Ok(Location::from(&reservation))
    }

    /// Trims the page-granular growth back to the data actually written
    pub fn finalize(self) -> io::Result<()> {
        self.inner.set_len(self.pos)?;
        self.inner.flush()
    }
}

pub struct MDItem<Kind: Sized> {
    reservation: Reservation,
    _kind: PD<Kind>,
}

impl<Kind> MDItem<Kind> {
    #[inline]
    pub fn location(&self) -> Location {
        Location::from(&self.reservation)
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.reservation.pos
    }

    pub fn write(self, item: Kind, fw: &mut FileWriter<'_>) -> io::Result<()> {
        fw.inner.seek(SeekFrom::Start(self.reservation.pos))?;
        fw.inner
            .write_all(crate::utils::to_byte_array(&item))?;

        Ok(())
    }
}

pub struct MDArray<Kind: Sized> {
    reservation: Reservation,
    _kind: PD<Kind>,
}

impl<Kind> MDArray<Kind> {
    #[inline]
    pub fn location(&self) -> Location {
        Location::from(&self.reservation)
    }

    pub fn write(&self, index: usize, item: Kind, fw: &mut FileWriter<'_>) -> io::Result<()> {
        fw.inner.seek(SeekFrom::Start(
            self.reservation.pos + (std::mem::size_of::<Kind>() * index) as u64,
        ))?;
        fw.inner
            .write_all(crate::utils::to_byte_array(&item))?;

        Ok(())
    }
}

pub struct MDHeaderArray<Header: Sized, Kind: Sized> {
    reservation: Reservation,
    _header: PD<Header>,
    _kind: PD<Kind>,
}

impl<Header, Kind> MDHeaderArray<Header, Kind> {
    #[inline]
    pub fn location(&self) -> Location {
        Location::from(&self.reservation)
    }

    pub fn write_header(&self, header: Header, fw: &mut FileWriter<'_>) -> io::Result<()> {
        fw.inner.seek(SeekFrom::Start(self.reservation.pos))?;
        fw.inner
            .write_all(crate::utils::to_byte_array(&header))?;

        Ok(())
    }

    pub fn write(&self, index: usize, item: Kind, fw: &mut FileWriter<'_>) -> io::Result<()> {
        fw.inner.seek(SeekFrom::Start(
            self.reservation.pos
                + (std::mem::size_of::<Header>() + std::mem::size_of::<Kind>() * index) as u64,
        ))?;
        fw.inner
            .write_all(crate::utils::to_byte_array(&item))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    fn temp_file(tag: &str) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!("mdh-fw-{}-{}", tag, std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (path, file)
    }

    #[test]
    fn reservations_round_trip() {
        let (path, mut file) = temp_file("res");

        {
            let mut fw = FileWriter::new(&mut file);

            let item = fw.reserve::<u32>().unwrap();
            let arr = fw.reserve_array::<u16>(3).unwrap();

            assert_eq!(item.location().rva, 0);
            assert_eq!(item.location().data_size, 4);
            assert_eq!(arr.location().rva, 4);
            assert_eq!(arr.location().data_size, 6);

            for (i, v) in [7u16, 8, 9].iter().enumerate() {
                arr.write(i, *v, &mut fw).unwrap();
            }
            item.write(0xdead_beefu32, &mut fw).unwrap();

            let bytes = fw.write_bytes(&[1, 2, 3]).unwrap();
            assert_eq!(bytes.rva, 10);

            assert_eq!(fw.position(), 13);
            fw.finalize().unwrap();
        }

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();

        // Trimmed back down from the page-granular allocation
        assert_eq!(contents.len(), 13);
        assert_eq!(&contents[..4], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&contents[4..10], &[7, 0, 8, 0, 9, 0]);
        assert_eq!(&contents[10..], &[1, 2, 3]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn writes_utf16_strings() {
        let (path, mut file) = temp_file("str");

        let loc = {
            let mut fw = FileWriter::new(&mut file);
            let loc = fw.write_string("libfoo.so").unwrap();
            fw.finalize().unwrap();
            loc
        };

        assert_eq!(loc.rva, 0);
        assert_eq!(loc.data_size, 4 + 9 * 2);

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();

        assert_eq!(&contents[..4], &(18u32).to_le_bytes());
        let units: Vec<u16> = contents[4..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "libfoo.so");

        std::fs::remove_file(path).unwrap();
    }
}
