use std::fs::File;
use std::path::Path;

use bytes::Bytes;

use crate::error::Result;

/// Load a whole file as shared bytes.
///
/// With the `memmap` feature the file is memory mapped and the mapping is owned by the
/// returned [`Bytes`], so slices handed out to tensors keep it alive. Otherwise the file is
/// read into memory once.
pub(crate) fn read_file(path: &Path) -> Result<Bytes> {
    let file = File::open(path)?;

    #[cfg(feature = "memmap")]
    {
        // An empty file cannot be mapped on every platform.
        if file.metadata()?.len() == 0 {
            return Ok(Bytes::new());
        }

        // SAFETY: the file is only read. Modifying it while it is mapped is undefined
        // behaviour, as with every memory mapped reader.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        log::debug!("Memory mapped {} ({} bytes)", path.display(), mmap.len());
        Ok(Bytes::from_owner(mmap))
    }

    #[cfg(not(feature = "memmap"))]
    {
        use std::io::Read;

        let mut file = file;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        log::debug!("Read {} ({} bytes)", path.display(), data.len());
        Ok(Bytes::from(data))
    }
}
