//! Property tests for the WAL frame codec and checksum chain.

use proptest::prelude::*;

use quarry_wal::checksum::{
    WAL_FRAME_HEADER_SIZE, WalChecksum, WalFrameHeader, WalSalts, frame_checksum, rolling_checksum,
    seal_frame,
};

proptest! {
    #[test]
    fn sealed_frames_verify(
        pgno in 1u32..=u32::MAX,
        db_size: u32,
        content in proptest::collection::vec(any::<u8>(), 512),
        salt1: u32,
        salt2: u32,
        seed1: u32,
        seed2: u32,
    ) {
        let mut frame = vec![0u8; WAL_FRAME_HEADER_SIZE + 512];
        frame[..4].copy_from_slice(&pgno.to_be_bytes());
        frame[4..8].copy_from_slice(&db_size.to_be_bytes());
        frame[WAL_FRAME_HEADER_SIZE..].copy_from_slice(&content);

        let salts = WalSalts { salt1, salt2 };
        let seed = WalChecksum { s1: seed1, s2: seed2 };
        let sealed = seal_frame(&mut frame, 512, salts, seed, false).unwrap();

        let header = WalFrameHeader::from_bytes(&frame).unwrap();
        prop_assert_eq!(header.page_number, pgno);
        prop_assert_eq!(header.db_size, db_size);
        prop_assert_eq!(header.salts, salts);
        prop_assert_eq!(header.checksum, sealed);
        prop_assert_eq!(header.is_commit(), db_size > 0);
        prop_assert_eq!(frame_checksum(&frame, 512, seed, false).unwrap(), sealed);
    }

    #[test]
    fn content_corruption_breaks_the_chain(
        content in proptest::collection::vec(any::<u8>(), 512),
        flip in 0usize..512,
        bit in 0u8..8,
    ) {
        let mut frame = vec![0u8; WAL_FRAME_HEADER_SIZE + 512];
        frame[..4].copy_from_slice(&7u32.to_be_bytes());
        frame[WAL_FRAME_HEADER_SIZE..].copy_from_slice(&content);

        let seed = WalChecksum { s1: 1, s2: 2 };
        let sealed = seal_frame(&mut frame, 512, WalSalts::default(), seed, false).unwrap();

        frame[WAL_FRAME_HEADER_SIZE + flip] ^= 1 << bit;
        let recomputed = frame_checksum(&frame, 512, seed, false).unwrap();
        prop_assert_ne!(recomputed, sealed, "single-bit corruption must change the checksum");
    }

    #[test]
    fn rolling_checksum_is_seed_sensitive(
        data in proptest::collection::vec(any::<u8>(), 64),
        seed1: u32,
        seed2: u32,
    ) {
        let a = rolling_checksum(&data, WalChecksum { s1: seed1, s2: seed2 }, false).unwrap();
        let b = rolling_checksum(
            &data,
            WalChecksum {
                s1: seed1.wrapping_add(1),
                s2: seed2,
            },
            false,
        )
        .unwrap();
        prop_assert_ne!(a, b);
    }
}
