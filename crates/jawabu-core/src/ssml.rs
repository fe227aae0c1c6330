//! SSML construction for the speech vendor.
//!
//! The builder is deliberately byte-stable: equal inputs produce identical
//! documents, because the rendered SSML's plain-text source feeds the
//! content-addressed audio cache. Nothing time- or request-dependent may
//! appear here.
//!
//! The body must be transformer output ([`crate::phoneme`]): the transformer
//! strips every markup-significant character from untrusted text, so the only
//! tags present are the ones it emitted and they are preserved verbatim.

use crate::org::TtsModel;

/// Normalise a language tag to `xx-YY` casing.
pub fn to_bcp47(language: &str) -> String {
    match language.split_once('-') {
        Some((lang, region)) => format!("{}-{}", lang.to_ascii_lowercase(), region.to_ascii_uppercase()),
        None => language.to_ascii_lowercase(),
    }
}

/// Escape a string for use inside an XML attribute value.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Build the synthesis document for one transformed text fragment.
pub fn build_ssml(transformed_text: &str, model: &TtsModel, language: &str) -> String {
    let lang = escape_attr(&to_bcp47(language));
    let voice = escape_attr(&model.name);
    let mut ssml = format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"{lang}\">\
         <voice name=\"{voice}\">"
    );
    match &model.pitch {
        Some(pitch) => {
            let pitch = escape_attr(pitch);
            ssml.push_str(&format!("<prosody pitch=\"{pitch}\" rate=\"medium\">"));
            ssml.push_str(transformed_text);
            ssml.push_str("</prosody>");
        }
        None => ssml.push_str(transformed_text),
    }
    ssml.push_str("</voice></speak>");
    ssml
}
