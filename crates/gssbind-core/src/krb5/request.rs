//! Just enough of RFC 4120 `KDC-REQ` to route a request to its realm's KDCs.

use ldap3::asn1::{StructureTag, TagClass, parse_tag};

const AS_REQ: u64 = 10;
const TGS_REQ: u64 = 12;
const REQ_BODY: u64 = 4;
const BODY_REALM: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdcRequestKind {
    /// Initial ticket request, answered by the client's own realm.
    As,
    /// Service ticket request, answered by the realm named in the body.
    Tgs,
}

/// Routing facts read from an encoded `AS-REQ` or `TGS-REQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcRequest {
    pub kind: KdcRequestKind,
    /// `req-body.realm`, upper-cased.
    pub realm: String,
}

impl KdcRequest {
    /// Reads an unframed `KDC-REQ`. Returns `None` for anything else.
    pub fn parse(message: &[u8]) -> Option<Self> {
        let (_, tag) = parse_tag(message).ok()?;
        let kind = match (tag.class, tag.id) {
            (TagClass::Application, AS_REQ) => KdcRequestKind::As,
            (TagClass::Application, TGS_REQ) => KdcRequestKind::Tgs,
            _ => return None,
        };

        let kdc_req = first(tag)?;
        let body = first(context_field(kdc_req, REQ_BODY)?)?;
        let realm = first(context_field(body, BODY_REALM)?)?.expect_primitive()?;

        Some(Self {
            kind,
            realm: String::from_utf8(realm).ok()?.to_uppercase(),
        })
    }
}

fn first(tag: StructureTag) -> Option<StructureTag> {
    tag.expect_constructed()?.into_iter().next()
}

fn context_field(sequence: StructureTag, id: u64) -> Option<StructureTag> {
    sequence
        .expect_constructed()?
        .into_iter()
        .find(|field| field.class == TagClass::Context && field.id == id)
}
