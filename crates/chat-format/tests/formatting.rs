use chat_format::{
    format_batch, format_batch_json, load_jsonl, read_jsonl, Example, FormatError, Formatter, Turn, IM_END, IM_START,
};
use std::io::Write;

fn conversation(roles: &[&str]) -> Example {
    Example::new(
        roles
            .iter()
            .enumerate()
            .map(|(i, r)| Turn::new(*r, format!("turn {}", i)))
            .collect(),
    )
}

#[test]
fn segments_match_turns_in_order() {
    let roles = ["system", "user", "assistant", "user", "assistant"];
    let text = chat_format::format_example(&conversation(&roles)).unwrap();

    let delim = format!("{}\n", IM_END);
    let segments: Vec<&str> = text.split(delim.as_str()).collect();
    assert_eq!(segments.last(), Some(&""));
    let segments = &segments[..segments.len() - 1];
    assert_eq!(segments.len(), roles.len());

    for (i, (segment, role)) in segments.iter().zip(roles.iter()).enumerate() {
        let expected = format!("{}{}\nturn {}", IM_START, role, i);
        assert_eq!(*segment, expected);
    }
}

#[test]
fn list_tables_scenario() {
    let line = r#"{"messages": [{"role":"user","content":"List tables"},{"role":"assistant","content":"SELECT * FROM information_schema.tables"}]}"#;
    let example: Example = serde_json::from_str(line).unwrap();
    assert_eq!(
        chat_format::format_example(&example).unwrap(),
        "<|im_start|>user\nList tables<|im_end|>\n<|im_start|>assistant\nSELECT * FROM information_schema.tables<|im_end|>\n"
    );
}

#[test]
fn batch_output_is_aligned_with_input() {
    let examples: Vec<Example> = (0..25)
        .map(|i| Example::new(vec![Turn::user(format!("q{}", i)), Turn::assistant(format!("a{}", i))]))
        .collect();
    let out = format_batch(&examples).unwrap();
    assert_eq!(out.text.len(), examples.len());
    for (i, text) in out.text.iter().enumerate() {
        assert!(text.contains(&format!("user\nq{}<|im_end|>", i)));
        assert!(text.ends_with(&format!("assistant\na{}<|im_end|>\n", i)));
    }
}

#[test]
fn repeated_calls_are_independent() {
    let formatter = Formatter::default();
    let examples = vec![conversation(&["user", "assistant"])];
    let first = formatter.format_batch(&examples).unwrap();
    let second = formatter.format_batch(&examples).unwrap();
    assert_eq!(first, second);
}

#[test]
fn loaded_file_with_missing_content_fails_at_format_time() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"messages": [{{"role": "system", "content": "You write SQL."}}]}}"#).unwrap();
    writeln!(file, r#"{{"messages": [{{"role": "user"}}]}}"#).unwrap();
    file.flush().unwrap();

    let examples = load_jsonl(file.path()).unwrap();
    assert_eq!(examples.len(), 2);
    assert!(matches!(
        format_batch(&examples).unwrap_err(),
        FormatError::MissingField { example: 1, turn: 0, field: "content" }
    ));
}

#[test]
fn file_and_column_batches_agree_on_non_string_fields() {
    let turns = r#"[{"role":"user","content":"List tables"},{"role":1,"content":"x"},{"role":"assistant","content":42}]"#;
    let line = format!(r#"{{"messages": {}}}"#, turns);

    let examples = read_jsonl(line.as_bytes()).unwrap();
    let from_file = format_batch(&examples).unwrap();
    assert_eq!(
        from_file.text,
        vec!["<|im_start|>user\nList tables<|im_end|>\n<|im_start|>assistant\n42<|im_end|>\n"]
    );

    let column: serde_json::Value = serde_json::from_str(&format!(r#"{{"messages": [{}]}}"#, turns)).unwrap();
    assert_eq!(format_batch_json(&column).unwrap(), from_file);

    assert!(matches!(
        Formatter::strict().format_batch(&examples).unwrap_err(),
        FormatError::UnrecognizedRole { example: 0, turn: 1, .. }
    ));
}
