//! Content of Qwen image-generation calls.
//!
//! Image-generation bodies do not follow the chat-completion layout: the
//! prompt, the reference images and the generated image URLs sit at
//! endpoint-specific paths. These helpers collect everything checkable.

use crate::extract::{lookup, value_as_text};
use crate::scheduler::ContentPiece;
use serde_json::Value;

const INLINE_IMAGE_PREFIX: &str = "data:image";

/// Prompt fields concatenated into the request text, in order.
const PROMPT_PATHS: &[&str] = &["input.prompt", "input.ref_prompt"];
const EDGE_PROMPT_PATHS: &[&str] = &[
    "input.reference_edge.foreground_edge_prompt",
    "input.reference_edge.background_edge_prompt",
];
const TRAILING_PROMPT_PATHS: &[&str] = &["input.text", "input.negative_prompt"];
const EDIT_MESSAGE_PATH: &str = "input.messages.0.content";

const IMAGE_PATHS: &[&str] = &[
    "input.image_url",
    "input.base_image_url",
    "input.mask_image_url",
    "input.sketch_image_url",
    "input.template_image_url",
    "input.shoe_image_url",
    "input.ref_image_url",
    "input.mask_url",
    "input.foreground_url",
    "input.person_image_url",
    "input.top_garment_url",
    "input.bottom_garment_url",
    "input.coarse_image_url",
    "input.template_url",
];
const IMAGE_ARRAY_PATHS: &[&str] = &[
    "input.images",
    "input.reference_edge.foreground_edge",
    "input.reference_edge.background_edge",
    "input.user_urls",
];

const RESULT_URL_PATHS: &[&str] = &[
    "output.image_url",
    "output.output_image_url",
    "output.result_url",
];
const RESULT_URL_ARRAY_PATHS: &[&str] = &["output.render_urls", "output.bg_urls"];

/// Checkable parts of an image-generation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageGenerationRequest {
    pub text: String,
    pub images: Vec<ContentPiece>,
}

impl ImageGenerationRequest {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }
}

/// Elements at `path`; a scalar counts as a one-element list.
fn items_at(root: &Value, path: &str) -> Vec<Value> {
    match lookup(root, path).map(|v| v.into_owned()) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn image_piece(content: String) -> ContentPiece {
    if content.starts_with(INLINE_IMAGE_PREFIX) {
        ContentPiece::image_base64(content)
    } else {
        ContentPiece::image_url(content)
    }
}

fn push_image(images: &mut Vec<ContentPiece>, value: &Value) {
    let content = value_as_text(value);
    if !content.is_empty() {
        images.push(image_piece(content));
    }
}

pub fn parse_qwen_request(root: &Value) -> ImageGenerationRequest {
    let mut request = ImageGenerationRequest::default();

    for path in PROMPT_PATHS {
        if let Some(value) = lookup(root, path) {
            request.text.push_str(&value_as_text(&value));
        }
    }
    for path in EDGE_PROMPT_PATHS {
        for item in items_at(root, path) {
            request.text.push_str(&value_as_text(&item));
        }
    }
    for path in TRAILING_PROMPT_PATHS {
        if let Some(value) = lookup(root, path) {
            request.text.push_str(&value_as_text(&value));
        }
    }

    // Image editing: text and image parts of the first message.
    for part in items_at(root, EDIT_MESSAGE_PATH) {
        if let Some(text) = part.get("text") {
            request.text.push_str(&value_as_text(text));
        } else if let Some(image) = part.get("image") {
            push_image(&mut request.images, image);
        }
    }

    for path in IMAGE_PATHS {
        if let Some(value) = lookup(root, path) {
            push_image(&mut request.images, &value);
        }
    }
    for path in IMAGE_ARRAY_PATHS {
        for item in items_at(root, path) {
            push_image(&mut request.images, &item);
        }
    }
    request
}

/// URLs of every generated image in a response, in discovery order.
pub fn parse_qwen_response(root: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    let mut push = |value: Option<&Value>| {
        if let Some(url) = value.map(value_as_text).filter(|u| !u.is_empty()) {
            urls.push(url);
        }
    };

    let results = items_at(root, "output.results");
    for result in &results {
        push(result.get("url"));
    }
    for part in items_at(root, "output.choices.0.message.content") {
        push(part.get("image"));
    }
    for path in RESULT_URL_PATHS {
        push(lookup(root, path).as_deref());
    }
    for path in RESULT_URL_ARRAY_PATHS {
        for item in items_at(root, path) {
            push(Some(&item));
        }
    }
    push(lookup(root, "output.output_vis_image_url").as_deref());
    for result in &results {
        push(result.get("png_url"));
        push(result.get("svg_url"));
    }
    urls
}
