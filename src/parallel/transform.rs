use crc32fast::Hasher;
use crate::core::error::Result;
use crate::core::types::{FieldValue, MetadataFields, TransformOutput};
use crate::index::extractor::header_fields;

/// Per-record transform run on the workers.
///
/// Must be free of side effects and shared mutable state: the same instance is
/// called concurrently from every worker.
pub trait RecordTransform: Send + Sync {
    fn transform(&self, record: &[u8]) -> Result<TransformOutput>;
}

impl<F> RecordTransform for F
where
    F: Fn(&[u8]) -> Result<TransformOutput> + Send + Sync,
{
    fn transform(&self, record: &[u8]) -> Result<TransformOutput> {
        self(record)
    }
}

/// Writes each record out unchanged, minus its envelope line, and records a few
/// header fields as metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRecordTransform;

impl RecordTransform for RawRecordTransform {
    fn transform(&self, record: &[u8]) -> Result<TransformOutput> {
        let body = match record.iter().position(|&b| b == b'\n') {
            Some(newline) => &record[newline + 1..],
            None => &[][..],
        };

        let mut metadata = MetadataFields::new();
        metadata.insert("byte_length".to_string(), FieldValue::Integer(record.len() as i64));
        metadata.insert(
            "line_count".to_string(),
            FieldValue::Integer(record.iter().filter(|&&b| b == b'\n').count() as i64),
        );
        for (name, value) in header_fields(record) {
            if matches!(name.as_str(), "subject" | "from" | "date") && !metadata.contains_key(&name) {
                metadata.insert(name, FieldValue::Text(value.trim().to_string()));
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(body);

        Ok(TransformOutput {
            rendered_artifact: body.to_vec(),
            metadata,
            fingerprint: hasher.finalize().to_be_bytes().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    #[test]
    fn raw_transform_strips_envelope() {
        let output = RawRecordTransform
            .transform(b"From a@b Mon\nSubject: Hi\nFrom: a@b\n\nbody\n")
            .unwrap();
        assert_eq!(output.rendered_artifact, b"Subject: Hi\nFrom: a@b\n\nbody\n");
        assert_eq!(output.metadata.get("subject"), Some(&FieldValue::Text("Hi".to_string())));
        assert_eq!(output.metadata.get("line_count"), Some(&FieldValue::Integer(5)));
        assert_eq!(output.fingerprint.len(), 4);
    }

    #[test]
    fn same_body_same_fingerprint() {
        let a = RawRecordTransform.transform(b"From x Mon\nbody\n").unwrap();
        let b = RawRecordTransform.transform(b"From y Tue\nbody\n").unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn closures_are_transforms() {
        let failing = |_: &[u8]| -> Result<TransformOutput> { Err(Error::transform("nope")) };
        assert!(failing.transform(b"x").is_err());
    }
}
