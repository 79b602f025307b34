//! Packager (array splicer)
//!
//! Accumulates serialized records into tenant-partitioned packages and
//! frames them into a single delimited payload on demand. Records are
//! appended to one flat buffer and tracked by `(offset, length)` spans so
//! that `splice()` never needs to touch already-serialized bytes, only
//! concatenate slices of the buffer it already owns.

use crate::pipeline::serializer::SerializedRecord;

const OPEN: u8 = b'[';
const CLOSE: u8 = b']';
const DELIM: u8 = b',';

#[derive(Debug, Clone, Copy)]
struct Span {
    offset: usize,
    length: usize,
}

struct PackageInfo {
    tenant_token: String,
    records: Vec<Span>,
}

/// Accumulates records grouped by tenant and frames them into one payload.
///
/// `splice()` does not consume the accumulated state — it may be called
/// repeatedly and will produce byte-identical output until the next
/// `add_record` or `clear`.
#[derive(Default)]
pub struct Packager {
    buffer: Vec<u8>,
    packages: Vec<PackageInfo>,
    overhead_estimate: usize,
}

/// Handle to a package returned by [`Packager::add_tenant_token`], used to
/// route subsequent [`Packager::add_record`] calls to the right group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageIndex(usize);

impl Packager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new package for `tenant_token` and returns a handle to it.
    pub fn add_tenant_token(&mut self, tenant_token: impl Into<String>) -> PackageIndex {
        let tenant_token = tenant_token.into();
        self.overhead_estimate += std::mem::size_of_val(&DELIM) + tenant_token.len();
        self.packages.push(PackageInfo {
            tenant_token,
            records: Vec::new(),
        });
        PackageIndex(self.packages.len() - 1)
    }

    /// Appends `record`'s bytes to `package`. Panics if `package` is stale
    /// (from a different accumulation after a `clear()`).
    pub fn add_record(&mut self, package: PackageIndex, record: &SerializedRecord) {
        assert!(package.0 < self.packages.len(), "stale package index");
        assert!(!record.bytes.is_empty(), "cannot package an empty record");

        let span = Span {
            offset: self.buffer.len(),
            length: record.bytes.len(),
        };
        self.packages[package.0].records.push(span);
        self.buffer.extend_from_slice(&record.bytes);
    }

    /// Exact byte count of record payloads accumulated so far.
    pub fn payload_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Upper bound on `splice().len()`, computable without framing.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len()
            + self.overhead_estimate
            + std::mem::size_of_val(&OPEN)
            + std::mem::size_of_val(&CLOSE)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.iter().all(|p| p.records.is_empty())
    }

    /// Tenant tokens of packages that currently hold at least one record, in
    /// insertion order.
    pub fn tenant_tokens(&self) -> impl Iterator<Item = &str> {
        self.packages
            .iter()
            .filter(|p| !p.records.is_empty())
            .map(|p| p.tenant_token.as_str())
    }

    /// Frames accumulated records into a single payload:
    /// `OPEN · record · DELIM · record · … · CLOSE`, packages and records in
    /// insertion order, no trailing delimiter. Idempotent until the next
    /// mutation.
    pub fn splice(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(self.size_estimate());
        output.push(OPEN);

        let mut first = true;
        for package in &self.packages {
            for span in &package.records {
                if !first {
                    output.push(DELIM);
                }
                first = false;
                output.extend_from_slice(&self.buffer[span.offset..span.offset + span.length]);
            }
        }

        output.push(CLOSE);
        output
    }

    /// Releases all underlying memory, not merely a logical reset.
    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.packages = Vec::new();
        self.overhead_estimate = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Priority;

    fn record(bytes: &[u8], tenant: &str) -> SerializedRecord {
        SerializedRecord {
            bytes: bytes.to_vec(),
            tenant_token: tenant.to_string(),
            priority: Priority::Normal,
            original_record_size: bytes.len(),
        }
    }

    #[test]
    fn empty_packager_splices_to_empty_array() {
        let packager = Packager::new();
        assert_eq!(packager.splice(), b"[]");
    }

    #[test]
    fn single_record_has_no_delimiters() {
        let mut packager = Packager::new();
        let idx = packager.add_tenant_token("T1");
        packager.add_record(idx, &record(b"r1", "T1"));
        assert_eq!(packager.splice(), b"[r1]");
    }

    #[test]
    fn multiple_records_are_comma_separated_without_trailing_delimiter() {
        let mut packager = Packager::new();
        let idx = packager.add_tenant_token("T1");
        packager.add_record(idx, &record(b"r1", "T1"));
        packager.add_record(idx, &record(b"r2", "T1"));
        packager.add_record(idx, &record(b"r3", "T1"));
        assert_eq!(packager.splice(), b"[r1,r2,r3]");
    }

    #[test]
    fn empty_packages_contribute_nothing() {
        let mut packager = Packager::new();
        let t1 = packager.add_tenant_token("T1");
        let _empty = packager.add_tenant_token("T2");
        let t3 = packager.add_tenant_token("T3");
        packager.add_record(t1, &record(b"a", "T1"));
        packager.add_record(t3, &record(b"b", "T3"));
        assert_eq!(packager.splice(), b"[a,b]");
    }

    #[test]
    fn splice_is_idempotent() {
        let mut packager = Packager::new();
        let idx = packager.add_tenant_token("T1");
        packager.add_record(idx, &record(b"a", "T1"));
        packager.add_record(idx, &record(b"b", "T1"));
        assert_eq!(packager.splice(), packager.splice());
    }

    #[test]
    fn clear_releases_state_and_resets_estimate() {
        let mut packager = Packager::new();
        let idx = packager.add_tenant_token("T1");
        packager.add_record(idx, &record(b"abcdef", "T1"));
        assert!(packager.size_estimate() > 0);
        packager.clear();
        assert_eq!(packager.size_estimate(), 2); // just OPEN + CLOSE
        assert_eq!(packager.splice(), b"[]");
    }

    #[test]
    fn size_estimate_is_an_upper_bound_on_splice_length() {
        let mut packager = Packager::new();
        let t1 = packager.add_tenant_token("T1");
        let t2 = packager.add_tenant_token("T2-longer-token");
        packager.add_record(t1, &record(b"one", "T1"));
        packager.add_record(t1, &record(b"two", "T1"));
        packager.add_record(t2, &record(b"three", "T2-longer-token"));
        assert!(packager.size_estimate() >= packager.splice().len());
    }

    #[test]
    fn multi_tenant_framing_preserves_insertion_order_within_each_tenant() {
        // Mirrors the end-to-end scenario: submissions to T1, T2, T1 in that
        // order must frame as T1.e1, T1.e3, T2.e2 — grouped by tenant,
        // insertion order preserved within group.
        let mut packager = Packager::new();
        let t1 = packager.add_tenant_token("T1");
        let t2 = packager.add_tenant_token("T2");
        packager.add_record(t1, &record(b"T1.e1", "T1"));
        packager.add_record(t2, &record(b"T2.e2", "T2"));
        packager.add_record(t1, &record(b"T1.e3", "T1"));
        assert_eq!(packager.splice(), b"[T1.e1,T1.e3,T2.e2]");
    }
}
