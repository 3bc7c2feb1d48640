use std::io::Cursor;

use msgbackup_core::codec::{
    ForwardSecrecyMetadata, IV_LEN, MAC_LEN, read_forward_secrecy_metadata,
};
use msgbackup_core::{
    AccountId, BackupCredentials, BackupKey, CodecSettings, EncryptedBackupWriter, Error,
    ErrorKind, ForwardSecrecyToken, MessageBackupKeys, decode_encrypted, encode_frames,
    inspect_encrypted, open_backup,
};

fn credentials() -> BackupCredentials {
    BackupCredentials {
        backup_key: BackupKey::from_bytes([0x11; 32]),
        account_id: AccountId(uuid::Uuid::from_u128(0x1234_5678)),
        forward_secrecy_token: Some(ForwardSecrecyToken::from_bytes([0x22; 32])),
    }
}

fn metadata() -> ForwardSecrecyMetadata {
    ForwardSecrecyMetadata::new((0u8..=255).cycle().take(300).collect()).unwrap()
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed;
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (x >> 56) as u8
        })
        .collect()
}

fn round_trip(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let keys = credentials().derive_keys().unwrap();
    let settings = CodecSettings::default();
    let bytes = encode_frames(frames, &keys, &metadata(), &settings).unwrap();
    decode_encrypted(Cursor::new(bytes), &keys, &settings)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn empty_frame_list_round_trips() {
    assert!(round_trip(&[]).is_empty());
}

#[test]
fn single_frame_round_trips() {
    let frames = vec![b"account frame".to_vec()];
    assert_eq!(round_trip(&frames), frames);
}

#[test]
fn multi_megabyte_multi_frame_round_trips() {
    let mut frames = Vec::new();
    let mut total = 0usize;
    let mut i = 0u64;
    while total < 4 * 1024 * 1024 {
        let len = 1 + (i as usize * 7919) % 200_000;
        let frame = if i % 3 == 0 {
            vec![(i % 251) as u8; len]
        } else {
            pseudo_random(len, i)
        };
        total += frame.len();
        frames.push(frame);
        i += 1;
    }
    frames.push(Vec::new());

    assert_eq!(round_trip(&frames), frames);
}

#[test]
fn metadata_can_be_read_before_keys_are_known() {
    let keys = credentials().derive_keys().unwrap();
    let bytes = encode_frames([b"x".as_slice()], &keys, &metadata(), &CodecSettings::default())
        .unwrap();

    let md = read_forward_secrecy_metadata(&mut bytes.as_slice()).unwrap();
    assert_eq!(md, metadata());

    let layout = inspect_encrypted(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(layout.metadata_len as usize, md.encoded_len());
    assert_eq!(layout.total_len as usize, bytes.len());
    assert!(layout.ciphertext_len as usize >= IV_LEN + 16);
}

#[test]
fn truncated_stream_is_truncation_not_integrity() {
    let keys = credentials().derive_keys().unwrap();
    let bytes = encode_frames([b"x".as_slice()], &keys, &metadata(), &CodecSettings::default())
        .unwrap();
    let md_len = metadata().encoded_len();

    let short = bytes[..md_len + MAC_LEN - 1].to_vec();
    let err = decode_encrypted(Cursor::new(short), &keys, &CodecSettings::default())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Truncated);
    assert_eq!(err.user_message(), Some("Could not read backup."));

    let cut_in_metadata = bytes[..md_len / 2].to_vec();
    let err = decode_encrypted(Cursor::new(cut_in_metadata), &keys, &CodecSettings::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::Truncated { .. }));
}

#[test]
fn tampering_anywhere_is_a_mac_mismatch() {
    let keys = credentials().derive_keys().unwrap();
    let bytes = encode_frames(
        [b"one".as_slice(), b"two".as_slice()],
        &keys,
        &metadata(),
        &CodecSettings::default(),
    )
    .unwrap();

    let md_len = metadata().encoded_len();
    for idx in [md_len - 1, md_len, md_len + IV_LEN, bytes.len() - 1] {
        let mut tampered = bytes.clone();
        tampered[idx] ^= 0x80;
        let err = decode_encrypted(Cursor::new(tampered), &keys, &CodecSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::MacMismatch), "index {idx}: {err:?}");
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}

#[test]
fn missing_forward_secrecy_token_derives_different_keys() {
    let keys = credentials().derive_keys().unwrap();
    let bytes = encode_frames([b"x".as_slice()], &keys, &metadata(), &CodecSettings::default())
        .unwrap();

    let mut without_token = credentials();
    without_token.forward_secrecy_token = None;
    let err = open_backup(Cursor::new(bytes), Some(&without_token), &CodecSettings::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::MacMismatch));
}

#[test]
fn oversize_frames_are_rejected_as_corrupt_on_decode() {
    let keys = MessageBackupKeys::derive(&BackupKey::from_bytes([5; 32]), &AccountId(uuid::Uuid::nil()), None)
        .unwrap();
    let mut writer = EncryptedBackupWriter::new(
        Vec::new(),
        &keys,
        &metadata(),
        &CodecSettings::default(),
    )
    .unwrap();
    writer.write_frame(&[7u8; 4096]).unwrap();
    let bytes = writer.finish().unwrap();

    let tight = CodecSettings {
        max_frame_bytes: 1024,
        ..CodecSettings::default()
    };
    let mut reader = decode_encrypted(Cursor::new(bytes), &keys, &tight).unwrap();
    assert!(matches!(reader.next_frame(), Err(Error::Corrupt { .. })));
}
