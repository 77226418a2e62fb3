//! VNID assignment for tenant namespaces: the valid id space, the
//! annotation keys carried on namespace records, and the range-backed
//! allocator used by the master.

pub mod allocator;
pub mod range;

use std::collections::BTreeMap;

use thiserror::Error;

pub use allocator::Allocator;
pub use range::VnidRange;

/// Maximum VXLAN virtual network identifier, per RFC 7348.
pub const MAX_VNID: u32 = (1 << 24) - 1;
/// Ids 1 to 9 are reserved; user allocation starts here.
pub const MIN_VNID: u32 = 10;
/// Traffic tagged 0 may reach every tenant in the cluster.
pub const GLOBAL_VNID: u32 = 0;

/// Current assigned VNID for the namespace.
pub const VNID_ANNOTATION: &str = "pod.network.openshift.io/multitenant.vnid";
/// Desired VNID for the namespace; consumed and cleared by the controller.
pub const REQUESTED_VNID_ANNOTATION: &str =
    "pod.network.openshift.io/multitenant.requested-vnid";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("VNID or requested VNID annotation not found")]
    NotFound,

    #[error("VNID must be {GLOBAL_VNID} or within [{MIN_VNID}, {MAX_VNID}], got {0}")]
    Invalid(u32),

    #[error("VNID annotation is not a decimal integer: {0:?}")]
    Malformed(String),

    #[error("range is full")]
    Full,

    #[error("provided VNID is not in the valid range")]
    NotInRange,

    #[error("provided VNID is already allocated")]
    Allocated,

    #[error("the provided VNID range does not match the current VNID range")]
    MismatchedRange,

    #[error("invalid VNID range: {0}")]
    InvalidRange(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn valid_vnid(vnid: u32) -> Result<()> {
    if vnid == GLOBAL_VNID {
        return Ok(());
    }
    if !(MIN_VNID..=MAX_VNID).contains(&vnid) {
        return Err(Error::Invalid(vnid));
    }
    Ok(())
}

/// Returns the VNID assigned to the namespace.
pub fn get_vnid(annotations: &BTreeMap<String, String>) -> Result<u32> {
    get_vnid_annotation(annotations, VNID_ANNOTATION)
}

/// Assigns a VNID to the namespace.
pub fn set_vnid(annotations: &mut BTreeMap<String, String>, id: u32) -> Result<()> {
    set_vnid_annotation(annotations, VNID_ANNOTATION, id)
}

pub fn delete_vnid(annotations: &mut BTreeMap<String, String>) {
    annotations.remove(VNID_ANNOTATION);
}

/// Returns the VNID an operator has requested for the namespace.
pub fn get_requested_vnid(annotations: &BTreeMap<String, String>) -> Result<u32> {
    get_vnid_annotation(annotations, REQUESTED_VNID_ANNOTATION)
}

pub fn set_requested_vnid(annotations: &mut BTreeMap<String, String>, id: u32) -> Result<()> {
    set_vnid_annotation(annotations, REQUESTED_VNID_ANNOTATION, id)
}

pub fn delete_requested_vnid(annotations: &mut BTreeMap<String, String>) {
    annotations.remove(REQUESTED_VNID_ANNOTATION);
}

fn get_vnid_annotation(annotations: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    let value = annotations.get(key).ok_or(Error::NotFound)?;
    let id: u32 = value
        .parse()
        .map_err(|_| Error::Malformed(value.clone()))?;
    valid_vnid(id)?;
    Ok(id)
}

fn set_vnid_annotation(
    annotations: &mut BTreeMap<String, String>,
    key: &str,
    id: u32,
) -> Result<()> {
    valid_vnid(id)?;
    annotations.insert(key.to_owned(), id.to_string());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_valid_vnid() {
        assert_eq!(valid_vnid(GLOBAL_VNID), Ok(()));
        assert_eq!(valid_vnid(MIN_VNID), Ok(()));
        assert_eq!(valid_vnid(MAX_VNID), Ok(()));
        assert_eq!(valid_vnid(1), Err(Error::Invalid(1)));
        assert_eq!(valid_vnid(9), Err(Error::Invalid(9)));
        assert_eq!(valid_vnid(MAX_VNID + 1), Err(Error::Invalid(MAX_VNID + 1)));
    }

    #[test]
    fn test_vnid_annotations() {
        let mut annotations = BTreeMap::new();
        assert_eq!(get_vnid(&annotations), Err(Error::NotFound));

        set_vnid(&mut annotations, 42).unwrap();
        assert_eq!(get_vnid(&annotations).unwrap(), 42);
        assert_eq!(get_requested_vnid(&annotations), Err(Error::NotFound));

        set_requested_vnid(&mut annotations, 100).unwrap();
        assert_eq!(get_requested_vnid(&annotations).unwrap(), 100);

        delete_requested_vnid(&mut annotations);
        assert_eq!(get_requested_vnid(&annotations), Err(Error::NotFound));

        delete_vnid(&mut annotations);
        assert_eq!(get_vnid(&annotations), Err(Error::NotFound));
    }

    #[test]
    fn test_reserved_vnid_rejected() {
        let mut annotations = BTreeMap::new();
        assert_eq!(set_vnid(&mut annotations, 5), Err(Error::Invalid(5)));
        assert!(annotations.is_empty());

        annotations.insert(VNID_ANNOTATION.to_owned(), "5".to_owned());
        assert_eq!(get_vnid(&annotations), Err(Error::Invalid(5)));

        annotations.insert(VNID_ANNOTATION.to_owned(), "junk".to_owned());
        assert_eq!(get_vnid(&annotations), Err(Error::Malformed("junk".into())));
    }
}
