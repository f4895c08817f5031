//! Enum types for Quill entities and rendered responses

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ENTITY KINDS
// ============================================================================

/// Entity kind discriminator, used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Tenant,
    User,
    Post,
    Comment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            EntityKind::Tenant => "Tenant",
            EntityKind::User => "User",
            EntityKind::Post => "Post",
            EntityKind::Comment => "Comment",
        };
        write!(f, "{}", value)
    }
}

// ============================================================================
// RESPONSE PAYLOAD ENUMS
// ============================================================================

/// Content type tag of a rendered response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Json,
    Xml,
    Html,
    PlainText,
}

impl ContentType {
    /// MIME type sent in the `Content-Type` header.
    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Xml => "application/xml",
            ContentType::Html => "text/html; charset=utf-8",
            ContentType::PlainText => "text/plain; charset=utf-8",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_mime())
    }
}

bitflags! {
    /// Boolean rendering options that change a response body.
    ///
    /// Packed into a single byte of the cache key, so at most eight flags
    /// can ever exist.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RenderFlags: u8 {
        /// Render XML instead of JSON.
        const XML = 0b0000_0001;
        /// Include unpublished drafts (tenant owner views).
        const INCLUDE_DRAFTS = 0b0000_0010;
        /// Render post and comment bodies from markdown (CommonMark plus tables,
        /// footnotes, strikethrough and task lists) to HTML. Raw HTML in a body
        /// is escaped.
        const RENDER_MARKDOWN = 0b0000_0100;
        /// Omit bodies from list views.
        const SUMMARY_ONLY = 0b0000_1000;
    }
}

impl RenderFlags {
    /// Content type of a body rendered with these flags.
    pub fn content_type(&self) -> ContentType {
        if self.contains(RenderFlags::XML) {
            ContentType::Xml
        } else {
            ContentType::Json
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_flags_fit_one_byte() {
        assert_eq!(RenderFlags::all().bits(), 0b0000_1111);
        let flags = RenderFlags::XML | RenderFlags::SUMMARY_ONLY;
        assert_eq!(RenderFlags::from_bits(flags.bits()), Some(flags));
    }

    #[test]
    fn test_render_flags_content_type() {
        assert_eq!(RenderFlags::empty().content_type(), ContentType::Json);
        assert_eq!(RenderFlags::XML.content_type(), ContentType::Xml);
    }

    #[test]
    fn test_content_type_mime() {
        assert_eq!(ContentType::Json.as_mime(), "application/json");
        assert_eq!(ContentType::Xml.to_string(), "application/xml");
    }
}
