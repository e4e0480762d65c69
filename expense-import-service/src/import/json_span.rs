/// First balanced `{...}` span in free text, honouring JSON string escapes.
///
/// Model replies often wrap the object in prose or code fences.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();

    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &byte) in bytes[start..].iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }

            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..=start + offset]);
                    }
                }
                _ => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_object_inside_prose() {
        let reply = "Sure! Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nAnything else?";
        assert_eq!(first_balanced_object(reply), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn braces_inside_strings_do_not_count() {
        let reply = r#"{"reason": "matched on name } with \"quote\" {", "x": 1} trailing"#;
        assert_eq!(
            first_balanced_object(reply),
            Some(r#"{"reason": "matched on name } with \"quote\" {", "x": 1}"#)
        );
    }

    #[test]
    fn unbalanced_text_yields_none() {
        assert_eq!(first_balanced_object("no json here"), None);
        assert_eq!(first_balanced_object("{\"open\": true"), None);
        assert_eq!(first_balanced_object(""), None);
    }

    #[test]
    fn empty_object_is_balanced() {
        assert_eq!(first_balanced_object("result: {} done"), Some("{}"));
    }
}
