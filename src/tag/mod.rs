//! Custom tag templates
//!
//! A template is literal text with `%placeholder%` substitutions. Templates
//! are compiled once at startup and checked against every configured image
//! before anything is built.

pub mod slug;

use crate::error::{KilnError, KilnResult};
use self::slug::{safe_slug, slug, validate_docker_tag};
use std::collections::HashMap;
use std::fmt;

/// Stand-in for the content-based tag while validating templates.
/// Longer than any real signature so length checks are conservative.
pub const CONTENT_BASED_TAG_STUB_LEN: usize = 70;

/// Repository value meaning "no remote storage"
pub const LOCAL_REPO: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
enum TagPart {
    Literal(String),
    Image,
    ImageSlug,
    ImageSafeSlug,
    ContentBasedTag,
}

impl TagPart {
    fn placeholder(name: &str) -> Option<Self> {
        match name {
            "image" => Some(Self::Image),
            "image_slug" => Some(Self::ImageSlug),
            "image_safe_slug" => Some(Self::ImageSafeSlug),
            "image_content_based_tag" => Some(Self::ContentBasedTag),
            _ => None,
        }
    }
}

/// A compiled tag template: `(image name, content-based tag) -> tag`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTagFunc {
    template: String,
    parts: Vec<TagPart>,
}

impl CustomTagFunc {
    /// Parse a template
    pub fn compile(template: &str) -> KilnResult<Self> {
        let invalid = |reason: String| KilnError::InvalidCustomTag {
            template: template.to_string(),
            reason,
        };

        if template.is_empty() {
            return Err(invalid("template is empty".to_string()));
        }

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find('%') {
            if start > 0 {
                parts.push(TagPart::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 1..];
            let end = after
                .find('%')
                .ok_or_else(|| invalid("unterminated placeholder".to_string()))?;
            let name = &after[..end];
            let part = TagPart::placeholder(name).ok_or_else(|| {
                invalid(format!(
                    "unknown placeholder %{}% (expected %image%, %image_slug%, \
                     %image_safe_slug% or %image_content_based_tag%)",
                    name
                ))
            })?;
            parts.push(part);
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(TagPart::Literal(rest.to_string()));
        }

        Ok(Self {
            template: template.to_string(),
            parts,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the produced tag varies with the image name
    pub fn uses_image_name(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, TagPart::Image | TagPart::ImageSlug | TagPart::ImageSafeSlug))
    }

    /// Produce the tag for one image
    pub fn apply(&self, image: &str, content_based_tag: &str) -> String {
        let mut tag = String::new();
        for part in &self.parts {
            match part {
                TagPart::Literal(text) => tag.push_str(text),
                TagPart::Image => tag.push_str(image),
                TagPart::ImageSlug => tag.push_str(&slug(image)),
                TagPart::ImageSafeSlug => tag.push_str(&safe_slug(image)),
                TagPart::ContentBasedTag => tag.push_str(content_based_tag),
            }
        }
        tag
    }

    /// Check the produced tags for every image: each must be a valid docker
    /// tag, and with several images no two may be equal.
    pub fn validate_for(&self, images: &[&str]) -> KilnResult<()> {
        let stub = "x".repeat(CONTENT_BASED_TAG_STUB_LEN);
        let mut produced: HashMap<String, &str> = HashMap::new();

        for &image in images {
            let tag = self.apply(image, &stub);
            validate_docker_tag(&tag).map_err(|reason| KilnError::InvalidCustomTag {
                template: self.template.clone(),
                reason: format!("image {}: {}", image, reason),
            })?;

            if produced.insert(tag, image).is_some() {
                return Err(KilnError::DuplicateCustomTag {
                    template: self.template.clone(),
                    suggestion: format!("%image%-{}", self.template),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for CustomTagFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.template)
    }
}

/// Tags resolved for one built image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTags {
    /// All custom tags, the "use" tag first
    pub tags: Vec<String>,
    /// Tag that replaces the content-based tag as the published reference
    pub use_tag: Option<String>,
}

/// Validated custom tag functions for a run
#[derive(Debug, Clone, Default)]
pub struct CustomTags {
    use_func: Option<CustomTagFunc>,
    add_funcs: Vec<CustomTagFunc>,
}

impl CustomTags {
    /// Compile and validate `--use-custom-tag` / `--add-custom-tag` values
    /// for the configured image set
    pub fn compile(
        use_tag: Option<&str>,
        add_tags: &[String],
        images: &[&str],
        repo: &str,
    ) -> KilnResult<Self> {
        let use_templates: Vec<&str> = use_tag.into_iter().filter(|t| !t.is_empty()).collect();
        if use_templates.is_empty() && add_tags.is_empty() {
            return Ok(Self::default());
        }

        if repo.is_empty() || repo == LOCAL_REPO {
            return Err(KilnError::CustomTagRequiresRepo);
        }

        let use_funcs = compile_all(use_templates.iter().copied(), images)?;
        let use_func = if use_funcs.is_empty() {
            None
        } else {
            Some(single(use_funcs)?)
        };
        let add_funcs = compile_all(add_tags.iter().map(String::as_str), images)?;

        Ok(Self { use_func, add_funcs })
    }

    pub fn is_empty(&self) -> bool {
        self.use_func.is_none() && self.add_funcs.is_empty()
    }

    /// Tags for a built image
    pub fn resolve(&self, image: &str, content_based_tag: &str) -> ResolvedTags {
        let use_tag = self
            .use_func
            .as_ref()
            .map(|f| f.apply(image, content_based_tag));

        let mut tags: Vec<String> = use_tag.iter().cloned().collect();
        for func in &self.add_funcs {
            let tag = func.apply(image, content_based_tag);
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        ResolvedTags { tags, use_tag }
    }
}

fn compile_all<'a>(
    templates: impl Iterator<Item = &'a str>,
    images: &[&str],
) -> KilnResult<Vec<CustomTagFunc>> {
    templates
        .map(|template| {
            let func = CustomTagFunc::compile(template)?;
            func.validate_for(images)?;
            Ok(func)
        })
        .collect()
}

/// The single function compiled from a "use" value
fn single(mut funcs: Vec<CustomTagFunc>) -> KilnResult<CustomTagFunc> {
    if funcs.len() != 1 {
        return Err(KilnError::Internal(format!(
            "expected exactly one use-custom-tag function, got {}",
            funcs.len()
        )));
    }
    funcs
        .pop()
        .ok_or_else(|| KilnError::Internal("use-custom-tag function missing".to_string()))
}
