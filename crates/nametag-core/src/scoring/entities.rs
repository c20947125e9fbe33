use crate::tagging::{BioTag, EntitySpan};

/// Extract entity spans from the first `length` tags of a sequence.
///
/// Tags at index `>= length` are padding and ignored. An `I-T` tag that does
/// not continue an open span of type `T` starts a new span, exactly like
/// `B-T`, so malformed sequences never error.
pub fn extract_entities<S: AsRef<str>>(tags: &[S], length: usize) -> Vec<EntitySpan> {
    let length = length.min(tags.len());
    let mut spans = Vec::new();
    let mut open: Option<(&str, usize)> = None;

    for (i, tag) in tags[..length].iter().enumerate() {
        match BioTag::parse(tag.as_ref()) {
            BioTag::Outside => {
                if let Some((entity_type, start)) = open.take() {
                    spans.push(EntitySpan::new(entity_type, start, i));
                }
            }
            BioTag::Begin(entity_type) => {
                if let Some((prev_type, start)) = open.replace((entity_type, i)) {
                    spans.push(EntitySpan::new(prev_type, start, i));
                }
            }
            BioTag::Inside(entity_type) => match open {
                Some((open_type, _)) if open_type == entity_type => {}
                _ => {
                    if let Some((prev_type, start)) = open.replace((entity_type, i)) {
                        spans.push(EntitySpan::new(prev_type, start, i));
                    }
                }
            },
        }
    }

    if let Some((entity_type, start)) = open {
        spans.push(EntitySpan::new(entity_type, start, length));
    }

    spans
}
