//! Output-side compression of ascending integer sequences: every maximal run
//! of at least three consecutive values is written as `a-b`, shorter runs as
//! space-separated values.

/// Formats an ascending id sequence.
pub fn format_ids<I: IntoIterator<Item = u32>>(ids: I) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut run: Option<(u32, u32)> = None;

    let mut flush = |run: &mut Option<(u32, u32)>, tokens: &mut Vec<String>| {
        if let Some((start, end)) = run.take() {
            if end - start >= 2 {
                tokens.push(format!("{}-{}", start, end));
            } else {
                for value in start..=end {
                    tokens.push(value.to_string());
                }
            }
        }
    };

    for id in ids {
        match run {
            Some((start, end)) if id == end + 1 => run = Some((start, id)),
            Some(_) => {
                flush(&mut run, &mut tokens);
                run = Some((id, id));
            }
            None => run = Some((id, id)),
        }
    }
    flush(&mut run, &mut tokens);
    tokens.join(" ")
}

/// Re-compresses a textual sequence (space-separated values and `a-b` runs).
/// Applying this to its own output is the identity.
pub fn compress_text(text: &str) -> String {
    let mut ids: Vec<u32> = Vec::new();
    for token in text.split_whitespace() {
        match token.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                    ids.extend(start..=end);
                }
            }
            None => {
                if let Ok(value) = token.parse::<u32>() {
                    ids.push(value);
                }
            }
        }
    }
    format_ids(ids)
}
