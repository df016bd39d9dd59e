use tempfile::TempDir;

use stevedore_types::digest::Digest;

use crate::store::ImageStore;

/// Fresh store in a scratch directory. Keep the `TempDir` alive for the
/// duration of the test.
pub fn new_store(gc: bool, dedupe: bool) -> (ImageStore, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = ImageStore::new(tmp.path(), gc, dedupe).unwrap();
    (store, tmp)
}

/// Upload `data` into `repo` through the full streaming path and return its
/// digest.
pub fn put_blob(store: &ImageStore, repo: &str, data: &[u8]) -> Digest {
    let digest = Digest::from_bytes(data);
    store
        .full_blob_upload(repo, data, &digest.to_string())
        .unwrap();
    digest
}

/// Minimal valid manifest body referencing the given layer digests.
pub fn manifest_body(layers: &[&Digest]) -> Vec<u8> {
    let layers = layers
        .iter()
        .map(|digest| {
            format!(
                r#"{{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"{digest}","size":0}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(r#"{{"schemaVersion":2,"layers":[{layers}]}}"#).into_bytes()
}
