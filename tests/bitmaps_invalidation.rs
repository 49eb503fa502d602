//! §1/§4.8: persistent dirty-tracking bitmaps are parsed but never incrementally maintained;
//! the core's only obligation is to invalidate them (clear the autoclear bit) on first write.

use std::sync::{Arc, Mutex};

use qcow2_core::header::AUTOCLEAR_BITMAPS;
use qcow2_core::{CreateOptions, Image, MemBackend, OpenOptions, StorageBackend};

#[derive(Clone)]
struct Shared(Arc<Mutex<MemBackend>>);
impl StorageBackend for Shared {
    fn len(&mut self) -> qcow2_core::Result<u64> {
        self.0.lock().unwrap().len()
    }
    fn set_len(&mut self, len: u64) -> qcow2_core::Result<()> {
        self.0.lock().unwrap().set_len(len)
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> qcow2_core::Result<()> {
        self.0.lock().unwrap().read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> qcow2_core::Result<()> {
        self.0.lock().unwrap().write_at(offset, buf)
    }
    fn flush(&mut self) -> qcow2_core::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

#[test]
fn first_write_clears_the_bitmaps_autoclear_bit() {
    let inner = Arc::new(Mutex::new(MemBackend::new()));

    let img = Image::create_with_backend(
        Box::new(Shared(inner.clone())),
        CreateOptions {
            cluster_bits: 16,
            ..CreateOptions::new(4 * 1024 * 1024)
        },
        None,
    )
    .unwrap();
    img.close().unwrap();

    // Patch the on-disk autoclear_features field (offset 88, big-endian u64) directly, as if
    // a prior tool had written a bitmaps extension and set its autoclear bit.
    {
        let mut mem = inner.lock().unwrap();
        let mut field = [0u8; 8];
        mem.read_at(88, &mut field).unwrap();
        let mut value = u64::from_be_bytes(field);
        value |= AUTOCLEAR_BITMAPS;
        mem.write_at(88, &value.to_be_bytes()).unwrap();
    }

    let img = Image::open_with_backend(Box::new(Shared(inner.clone())), None, OpenOptions::default()).unwrap();
    img.write_at(&[1u8; 16], 0).unwrap();
    img.close().unwrap();

    let mut mem = inner.lock().unwrap();
    let mut field = [0u8; 8];
    mem.read_at(88, &mut field).unwrap();
    let value = u64::from_be_bytes(field);
    assert_eq!(value & AUTOCLEAR_BITMAPS, 0, "autoclear bitmaps bit must be cleared after first write");
}
