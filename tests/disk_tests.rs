//! Integration tests for the disk backend: persistence, restore and corruption.

use std::path::Path;

use tensor_vault::config::Backend;
use tensor_vault::tensor::dtype::encode;
use tensor_vault::{
    Config, DType, ReadOptions, TensorId, TensorSpec, TensorState, TensorVault, VaultError,
};

fn disk_config(root: &Path, compress: bool) -> Config {
    let mut config = Config::default();
    config.store.backend = Backend::Disk;
    config.store.root = root.to_path_buf();
    config.store.compress_at_rest = compress;
    config.store.max_chunk_bytes = 256;
    config
}

fn chunk_file(root: &Path, id: TensorId, index: u32) -> std::path::PathBuf {
    let simple = id.as_uuid().simple().to_string();
    root.join("chunks")
        .join(&simple[..2])
        .join(&simple)
        .join(format!("{index:08}.chunk"))
}

#[tokio::test]
async fn test_reopen_restores_finalized_tensors() {
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f32> = (0..256).map(|i| i as f32).collect();

    let (id, pending) = {
        let vault = TensorVault::open(disk_config(dir.path(), true)).await.unwrap();
        let id = vault
            .store_tensor(TensorSpec::new("w", DType::F32, vec![16, 16]), encode(&values))
            .await
            .unwrap();
        let pending = vault
            .catalog()
            .create(TensorSpec::new("half", DType::U8, vec![8]))
            .await
            .unwrap();
        vault
            .catalog()
            .append_chunk(pending, 0, vec![0u8; 4], 4)
            .await
            .unwrap();
        vault.shutdown().await;
        (id, pending)
    };

    let vault = TensorVault::open(disk_config(dir.path(), true)).await.unwrap();
    let (descriptor, bytes) = vault.catalog().read_bytes(id).await.unwrap();
    assert_eq!(descriptor.state, TensorState::Finalized);
    assert_eq!(descriptor.shape, vec![16, 16]);
    assert_eq!(&bytes[..], &encode(&values)[..]);
    assert!(vault.catalog().verify(id).await.unwrap());

    // Pending tensors are not durable; their chunks were cleaned up.
    assert!(matches!(
        vault.catalog().read(pending).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(!chunk_file(dir.path(), pending, 0).exists());
}

#[tokio::test]
async fn test_delete_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let vault = TensorVault::open(disk_config(dir.path(), false)).await.unwrap();
    let id = vault
        .store_tensor(TensorSpec::new("d", DType::U8, vec![4]), vec![1u8, 2, 3, 4])
        .await
        .unwrap();
    assert!(chunk_file(dir.path(), id, 0).exists());

    vault.catalog().delete(id).await.unwrap();
    vault.catalog().delete(id).await.unwrap();
    assert!(!chunk_file(dir.path(), id, 0).exists());

    vault.shutdown().await;
    let reopened = TensorVault::open(disk_config(dir.path(), false)).await.unwrap();
    assert!(reopened.catalog().read(id).await.is_err());
}

#[tokio::test]
async fn test_corrupted_chunk_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let vault = TensorVault::open(disk_config(dir.path(), false)).await.unwrap();
    let id = vault
        .store_tensor(TensorSpec::new("c", DType::U8, vec![64]), vec![7u8; 64])
        .await
        .unwrap();

    // Flip one payload byte behind the store's back.
    let path = chunk_file(dir.path(), id, 0);
    let mut raw = std::fs::read(&path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    std::fs::write(&path, raw).unwrap();

    assert!(!vault.catalog().verify(id).await.unwrap());
    let err = vault
        .catalog()
        .read_with(id, ReadOptions { verify: true })
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::CorruptTensor { .. }));
    assert!(err.is_integrity_failure());
    assert!(vault.metrics().corrupt_reads.get() >= 2);
}

#[tokio::test]
async fn test_truncated_chunk_file() {
    let dir = tempfile::tempdir().unwrap();
    let vault = TensorVault::open(disk_config(dir.path(), true)).await.unwrap();
    let id = vault
        .store_tensor(TensorSpec::new("t", DType::U8, vec![32]), vec![1u8; 32])
        .await
        .unwrap();

    std::fs::write(chunk_file(dir.path(), id, 0), b"TV").unwrap();
    let err = vault.catalog().read(id).await.unwrap_err();
    match err {
        VaultError::CorruptTensor { tensor_id, chunks, .. } => {
            assert_eq!(tensor_id, id);
            assert_eq!(chunks, 0..1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_chunk_header_element_count_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let vault = TensorVault::open(disk_config(dir.path(), false)).await.unwrap();
    let id = vault
        .store_tensor(TensorSpec::new("h", DType::U8, vec![64]), vec![3u8; 64])
        .await
        .unwrap();

    // Rewrite the header's element count; the payload is untouched.
    let path = chunk_file(dir.path(), id, 0);
    let mut raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[8..16], &64u64.to_le_bytes());
    raw[8..16].copy_from_slice(&63u64.to_le_bytes());
    std::fs::write(&path, raw).unwrap();

    let err = vault.catalog().read(id).await.unwrap_err();
    match err {
        VaultError::CorruptTensor { tensor_id, chunks, .. } => {
            assert_eq!(tensor_id, id);
            assert_eq!(chunks, 0..1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!vault.catalog().verify(id).await.unwrap());
}
