//! Property test (§8 item 1): any sequence of writes, checked against a plain in-memory
//! shadow buffer, must agree with what `read_at` reports afterwards. Modeled on the teacher's
//! own shadow-buffer property test shape (`prop_storage.rs`'s `apply_ops`/model-vs-disk diff).

use proptest::prelude::*;
use qcow2_core::{CreateOptions, Image, MemBackend};

const CAPACITY: u64 = 64 * 1024; // small, so proptest can run many cases quickly
const MAX_OPS: usize = 40;
const MAX_WRITE_LEN: usize = 2048;

#[derive(Clone, Debug)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Read { offset: u64, len: usize },
}

fn offset_len_strategy() -> impl Strategy<Value = (u64, usize)> {
    (0u64..CAPACITY).prop_flat_map(|offset| {
        let max_len = (CAPACITY - offset).min(MAX_WRITE_LEN as u64) as usize;
        (1usize..=max_len.max(1)).prop_map(move |len| (offset, len.min(max_len.max(1))))
    })
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => offset_len_strategy().prop_flat_map(|(offset, len)| {
            prop::collection::vec(any::<u8>(), len).prop_map(move |data| Op::Write { offset, data })
        }),
        2 => offset_len_strategy().prop_map(|(offset, len)| Op::Read { offset, len }),
    ]
}

fn make_image() -> Image {
    Image::create_with_backend(
        Box::new(MemBackend::new()),
        CreateOptions {
            cluster_bits: 12, // 4 KiB clusters, several per disk for boundary coverage
            ..CreateOptions::new(CAPACITY)
        },
        None,
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn writes_and_reads_agree_with_a_shadow_buffer(ops in prop::collection::vec(op_strategy(), 1..=MAX_OPS)) {
        let img = make_image();
        let mut model = vec![0u8; CAPACITY as usize];

        for op in &ops {
            match op {
                Op::Write { offset, data } => {
                    let n = img.write_at(data, *offset).unwrap();
                    prop_assert_eq!(n, data.len());
                    model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
                }
                Op::Read { offset, len } => {
                    let mut buf = vec![0u8; *len];
                    let n = img.read_at(&mut buf, *offset).unwrap();
                    prop_assert_eq!(n, *len);
                    prop_assert_eq!(&buf[..], &model[*offset as usize..*offset as usize + *len]);
                }
            }
        }

        // Final whole-disk comparison in addition to the interleaved per-op reads above.
        let mut whole = vec![0u8; CAPACITY as usize];
        img.read_at(&mut whole, 0).unwrap();
        prop_assert_eq!(whole, model);
    }
}
