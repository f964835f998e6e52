use pyboot_wasm::ArtifactSink;

use super::meta::SnapshotType;

/// Captured snapshot bytes waiting for an I/O context to upload them in.
///
/// Uploading needs a request context, so the bytes are parked here until the
/// first user request arrives. This is the single reference to the encoded
/// artifact; completing (or terminally failing) the upload releases it so
/// the memory can be reclaimed.
pub struct PendingUpload {
    bytes: Option<Vec<u8>>,
    snapshot_type: SnapshotType,
    imported_modules: Option<Vec<String>>,
}

impl PendingUpload {
    pub(crate) fn new(bytes: Vec<u8>, snapshot_type: SnapshotType, imported_modules: Option<Vec<String>>) -> Self {
        PendingUpload {
            bytes: Some(bytes),
            snapshot_type,
            imported_modules,
        }
    }

    pub fn snapshot_type(&self) -> SnapshotType {
        self.snapshot_type
    }

    pub fn imported_modules(&self) -> Option<&[String]> {
        self.imported_modules.as_deref()
    }

    /// The encoded artifact, if the upload has not completed yet.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Hands the artifact to the validator sink and releases the buffer.
    ///
    /// A failed upload is logged and reported, nothing more: the interpreter
    /// keeps running, and a snapshotless next start is correct, only slower.
    pub fn complete(&mut self, sink: &mut dyn ArtifactSink) -> bool {
        let Some(bytes) = self.bytes.take() else {
            tracing::warn!("snapshot upload was already completed");
            return false;
        };
        let stored = sink.store(&bytes, self.imported_modules.as_deref(), self.snapshot_type.as_str());
        if stored {
            tracing::info!(
                "stored a {} snapshot of {} bytes",
                self.snapshot_type,
                bytes.len()
            );
        } else {
            tracing::warn!("snapshot upload failed; the next start will be snapshotless");
        }
        stored
    }

    /// Writes the artifact to the disk sink and releases the buffer.
    pub fn write_to_disk(&mut self, sink: &mut dyn ArtifactSink) -> bool {
        let Some(bytes) = self.bytes.take() else {
            tracing::warn!("snapshot upload was already completed");
            return false;
        };
        match sink.put("snapshot.bin", &bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to write the snapshot to disk: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutil::FakeSink;

    #[test]
    fn completing_an_upload_releases_the_buffer() {
        let mut upload = PendingUpload::new(vec![1, 2, 3], SnapshotType::Package, Some(vec!["numpy".to_owned()]));
        let mut sink = FakeSink::accepting();

        assert!(upload.complete(&mut sink));
        assert_eq!(sink.stored.len(), 1);
        assert_eq!(sink.stored[0].0, 3);
        assert_eq!(sink.stored[0].2, "package");
        assert!(upload.bytes().is_none());

        // A second completion is a no-op, not a double upload.
        assert!(!upload.complete(&mut sink));
        assert_eq!(sink.stored.len(), 1);
    }

    #[test]
    fn disk_sinks_write_under_the_fixed_name() {
        let mut upload = PendingUpload::new(vec![9; 8], SnapshotType::Dedicated, None);
        let mut sink = FakeSink::accepting();

        assert!(upload.write_to_disk(&mut sink));
        assert_eq!(sink.puts, vec![("snapshot.bin".to_owned(), 8)]);
        assert!(upload.bytes().is_none());
    }

    #[test]
    fn failed_uploads_still_release_the_buffer() {
        let mut upload = PendingUpload::new(vec![0; 16], SnapshotType::Baseline, None);
        let mut sink = FakeSink {
            accept: false,
            ..FakeSink::default()
        };

        assert!(!upload.complete(&mut sink));
        assert!(upload.bytes().is_none());
    }
}
