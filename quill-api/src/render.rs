//! Response rendering into pooled scratch buffers.
//!
//! Every renderer writes into a [`PooledBuffer`] and [`finish`] copies the
//! bytes into an owned [`CacheEntry`] body, so cached entries never alias
//! pooled memory. [`RenderFlags::XML`] selects XML output, JSON otherwise.

use std::borrow::Cow;
use std::io::{self, Write};

use quill_core::{
    CacheError, Comment, EntityIdType, Post, PostId, QuillError, QuillResult, RenderFlags, Tenant,
    Timestamp,
};
use pulldown_cmark::{html, Event, Options, Parser};
use pulldown_cmark_escape::{escape_html, IoWriter};
use quill_storage::{CacheEntry, PooledBuffer};
use serde::Serialize;

fn render_failed(err: impl std::fmt::Display) -> QuillError {
    CacheError::Render {
        reason: err.to_string(),
    }
    .into()
}

/// Copy the rendered bytes into a `200 OK` entry and return the buffer.
pub fn finish(buf: PooledBuffer, flags: RenderFlags) -> CacheEntry {
    let entry = CacheEntry::ok(flags.content_type(), buf.copy());
    buf.release();
    entry
}

/// Markdown to HTML. Raw HTML in the source comes out as escaped text.
pub fn render_markdown(input: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(input, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        event => event,
    });
    let mut html_output = String::with_capacity(input.len() + input.len() / 2);
    html::push_html(&mut html_output, parser);
    html_output
}

/// Write `text` escaped for XML element content and attribute values.
fn write_escaped<W: Write>(out: &mut W, text: &str) -> io::Result<()> {
    escape_html(IoWriter(out), text)
}

fn post_body(body: &str, flags: RenderFlags) -> Cow<'_, str> {
    if flags.contains(RenderFlags::RENDER_MARKDOWN) {
        Cow::Owned(render_markdown(body))
    } else {
        Cow::Borrowed(body)
    }
}

// ============================================================================
// VIEWS
// ============================================================================

#[derive(Serialize)]
struct PostView<'a> {
    post_id: PostId,
    author_id: i64,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Cow<'a, str>>,
    published: bool,
    created_at: Timestamp,
}

impl<'a> PostView<'a> {
    fn new(post: &'a Post, flags: RenderFlags, with_body: bool) -> Self {
        Self {
            post_id: post.post_id,
            author_id: post.author_id.as_i64(),
            title: &post.title,
            body: with_body.then(|| post_body(&post.body, flags)),
            published: post.published,
            created_at: post.created_at,
        }
    }
}

#[derive(Serialize)]
struct PostPage<'a> {
    tenant: &'a str,
    page: u32,
    posts: Vec<PostView<'a>>,
}

#[derive(Serialize)]
struct CommentView<'a> {
    comment_id: i64,
    author_id: i64,
    body: Cow<'a, str>,
    created_at: Timestamp,
}

#[derive(Serialize)]
struct CommentPage<'a> {
    post_id: PostId,
    comments: Vec<CommentView<'a>>,
}

#[derive(Serialize)]
struct TenantView<'a> {
    tenant_id: i64,
    slug: &'a str,
    created_at: Timestamp,
    published_posts: usize,
}

// ============================================================================
// XML WRITERS
// ============================================================================

fn write_post_xml(out: &mut impl Write, view: &PostView<'_>) -> io::Result<()> {
    write!(
        out,
        "<post id=\"{}\" author=\"{}\" published=\"{}\" created_at=\"{}\"><title>",
        view.post_id.as_i64(),
        view.author_id,
        view.published,
        view.created_at.to_rfc3339(),
    )?;
    write_escaped(out, view.title)?;
    out.write_all(b"</title>")?;
    if let Some(body) = &view.body {
        out.write_all(b"<body>")?;
        write_escaped(out, body)?;
        out.write_all(b"</body>")?;
    }
    out.write_all(b"</post>")
}

// ============================================================================
// RENDERERS
// ============================================================================

/// A page of a tenant's posts. `SUMMARY_ONLY` omits bodies.
pub fn render_post_list(
    buf: &mut PooledBuffer,
    tenant: &Tenant,
    page: u32,
    posts: &[Post],
    flags: RenderFlags,
) -> QuillResult<()> {
    let with_body = !flags.contains(RenderFlags::SUMMARY_ONLY);
    let view = PostPage {
        tenant: &tenant.slug,
        page,
        posts: posts.iter().map(|p| PostView::new(p, flags, with_body)).collect(),
    };

    if flags.contains(RenderFlags::XML) {
        let write = |out: &mut PooledBuffer| -> io::Result<()> {
            out.write_all(b"<posts tenant=\"")?;
            write_escaped(out, view.tenant)?;
            write!(out, "\" page=\"{}\">", view.page)?;
            for post in &view.posts {
                write_post_xml(out, post)?;
            }
            out.write_all(b"</posts>")
        };
        write(buf).map_err(render_failed)
    } else {
        serde_json::to_writer(buf, &view).map_err(render_failed)
    }
}

/// A single post with its body.
pub fn render_post(buf: &mut PooledBuffer, post: &Post, flags: RenderFlags) -> QuillResult<()> {
    let view = PostView::new(post, flags, true);
    if flags.contains(RenderFlags::XML) {
        write_post_xml(buf, &view).map_err(render_failed)
    } else {
        serde_json::to_writer(buf, &view).map_err(render_failed)
    }
}

/// The comments of one post, oldest first.
pub fn render_comments(
    buf: &mut PooledBuffer,
    post_id: PostId,
    comments: &[Comment],
    flags: RenderFlags,
) -> QuillResult<()> {
    let view = CommentPage {
        post_id,
        comments: comments
            .iter()
            .map(|c| CommentView {
                comment_id: c.comment_id.as_i64(),
                author_id: c.author_id.as_i64(),
                body: post_body(&c.body, flags),
                created_at: c.created_at,
            })
            .collect(),
    };

    if flags.contains(RenderFlags::XML) {
        let write = |out: &mut PooledBuffer| -> io::Result<()> {
            write!(out, "<comments post=\"{}\">", view.post_id.as_i64())?;
            for comment in &view.comments {
                write!(
                    out,
                    "<comment id=\"{}\" author=\"{}\" created_at=\"{}\">",
                    comment.comment_id,
                    comment.author_id,
                    comment.created_at.to_rfc3339(),
                )?;
                write_escaped(out, &comment.body)?;
                out.write_all(b"</comment>")?;
            }
            out.write_all(b"</comments>")
        };
        write(buf).map_err(render_failed)
    } else {
        serde_json::to_writer(buf, &view).map_err(render_failed)
    }
}

/// Tenant front matter.
pub fn render_tenant(
    buf: &mut PooledBuffer,
    tenant: &Tenant,
    published_posts: usize,
    flags: RenderFlags,
) -> QuillResult<()> {
    let view = TenantView {
        tenant_id: tenant.tenant_id.as_i64(),
        slug: &tenant.slug,
        created_at: tenant.created_at,
        published_posts,
    };

    if flags.contains(RenderFlags::XML) {
        let write = |out: &mut PooledBuffer| -> io::Result<()> {
            write!(out, "<tenant id=\"{}\" slug=\"", view.tenant_id)?;
            write_escaped(out, view.slug)?;
            write!(
                out,
                "\" created_at=\"{}\" published_posts=\"{}\"/>",
                view.created_at.to_rfc3339(),
                view.published_posts
            )
        };
        write(buf).map_err(render_failed)
    } else {
        serde_json::to_writer(buf, &view).map_err(render_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use quill_core::{ShardId, TenantId, UserId};
    use quill_storage::{BufferPool, BufferPoolConfig};
    use std::sync::Arc;

    fn buffers() -> Arc<BufferPool> {
        BufferPool::new(BufferPoolConfig::default()).unwrap()
    }

    fn post(id: i64, title: &str, body: &str) -> Post {
        Post {
            post_id: PostId::new(id),
            tenant_id: TenantId::new(1),
            author_id: UserId::new(7),
            title: title.to_string(),
            body: body.to_string(),
            published: true,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn tenant() -> Tenant {
        Tenant {
            tenant_id: TenantId::new(1),
            slug: "daily".to_string(),
            shard_id: ShardId::new(0),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_write_escaped() {
        let mut out = Vec::new();
        write_escaped(&mut out, "a<b & \"c\"").unwrap();
        assert_eq!(out, b"a&lt;b &amp; &quot;c&quot;");
    }

    #[test]
    fn test_render_markdown_emphasis_links_and_headings() {
        let html = render_markdown("This is **bold** and a [link](http://x)\n\n# Heading");
        assert!(html.contains("<strong>bold</strong>"));
        assert!(html.contains("<a href=\"http://x\">link</a>"));
        assert!(html.contains("<h1>Heading</h1>"));
        assert!(!html.contains("**"));
    }

    #[test]
    fn test_render_markdown_escapes_raw_html() {
        let html = render_markdown("hi <b>there</b>\n\n<script>alert(1)</script>");
        assert!(!html.contains("<script>"));
        assert!(!html.contains("<b>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_post_list_json_summary_omits_bodies() {
        let pool = buffers();
        let mut buf = pool.acquire();
        let posts = vec![post(2, "Second", "b"), post(1, "First", "a")];
        render_post_list(&mut buf, &tenant(), 1, &posts, RenderFlags::SUMMARY_ONLY).unwrap();

        let json: serde_json::Value = serde_json::from_slice(buf.as_bytes()).unwrap();
        assert_eq!(json["tenant"], "daily");
        assert_eq!(json["posts"][0]["post_id"], 2);
        assert!(json["posts"][0].get("body").is_none());
    }

    #[test]
    fn test_post_xml_is_escaped() {
        let pool = buffers();
        let mut buf = pool.acquire();
        render_post(&mut buf, &post(3, "Fish & <Chips>", "x"), RenderFlags::XML).unwrap();
        let xml = std::str::from_utf8(buf.as_bytes()).unwrap();
        assert!(xml.starts_with("<post id=\"3\" author=\"7\""));
        assert!(xml.contains("<title>Fish &amp; &lt;Chips&gt;</title>"));
        assert!(xml.ends_with("<body>x</body></post>"));
    }

    #[test]
    fn test_markdown_flag_renders_html_bodies() {
        let pool = buffers();
        let mut buf = pool.acquire();
        let post = post(1, "t", "hello *there*\n\nworld");
        render_post(&mut buf, &post, RenderFlags::RENDER_MARKDOWN).unwrap();
        let json: serde_json::Value = serde_json::from_slice(buf.as_bytes()).unwrap();
        assert_eq!(json["body"], "<p>hello <em>there</em></p>\n<p>world</p>\n");

        // Without the flag the markdown source is returned as is.
        let mut buf = pool.acquire();
        render_post(&mut buf, &post, RenderFlags::empty()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(buf.as_bytes()).unwrap();
        assert_eq!(json["body"], "hello *there*\n\nworld");
    }

    #[test]
    fn test_markdown_in_xml_is_escaped_html() {
        let pool = buffers();
        let mut buf = pool.acquire();
        let flags = RenderFlags::XML | RenderFlags::RENDER_MARKDOWN;
        render_post(&mut buf, &post(1, "t", "**hi**"), flags).unwrap();
        let xml = std::str::from_utf8(buf.as_bytes()).unwrap();
        assert!(xml.contains("<body>&lt;p&gt;&lt;strong&gt;hi&lt;/strong&gt;&lt;/p&gt;\n</body>"));
    }

    #[test]
    fn test_finish_copies_and_tags_content_type() {
        let pool = buffers();
        let mut buf = pool.acquire();
        render_tenant(&mut buf, &tenant(), 4, RenderFlags::XML).unwrap();
        let entry = finish(buf, RenderFlags::XML);
        assert_eq!(entry.status(), 200);
        assert_eq!(entry.content_type(), quill_core::ContentType::Xml);
        assert!(std::str::from_utf8(entry.body()).unwrap().contains("published_posts=\"4\""));
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn test_comments_json() {
        let pool = buffers();
        let mut buf = pool.acquire();
        let comment = Comment {
            comment_id: quill_core::CommentId::new(5),
            tenant_id: TenantId::new(1),
            post_id: PostId::new(1),
            author_id: UserId::new(2),
            body: "nice".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        };
        render_comments(&mut buf, PostId::new(1), &[comment], RenderFlags::empty()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(buf.as_bytes()).unwrap();
        assert_eq!(json["post_id"], 1);
        assert_eq!(json["comments"][0]["body"], "nice");
    }
}
