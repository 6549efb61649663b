use serde::{Deserialize, Serialize};

/// One created object, as delivered by the notification source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Bucket holding the object
    pub bucket_name: String,
    /// Full key of the created object
    pub object_key: String,
}

impl ChangeNotification {
    pub fn new(bucket_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
        }
    }

    /// Base identifier of the object this notification describes
    pub fn base_identifier(&self) -> &str {
        crate::addressing::base_identifier(&self.object_key)
    }
}

/// S3 event notification envelope
///
/// Test events sent by S3 when a notification target is configured carry no
/// `Records`, so the field defaults to empty.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3EventRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

impl From<S3EventRecord> for ChangeNotification {
    fn from(record: S3EventRecord) -> Self {
        Self {
            bucket_name: record.s3.bucket.name,
            object_key: decode_object_key(&record.s3.object.key),
        }
    }
}

/// Decode an event object key, which S3 delivers form-urlencoded
///
/// Keys that do not decode to valid UTF-8 are returned unchanged.
pub fn decode_object_key(key: &str) -> String {
    let bytes = key.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                decoded.push(hex_value(bytes[i + 1]) << 4 | hex_value(bytes[i + 2]));
                i += 2;
            }
            byte => decoded.push(byte),
        }
        i += 1;
    }
    String::from_utf8(decoded).unwrap_or_else(|_| key.to_string())
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

impl S3Event {
    /// Consume the envelope into one notification per record
    pub fn into_notifications(self) -> Vec<ChangeNotification> {
        self.records.into_iter().map(Into::into).collect()
    }
}
