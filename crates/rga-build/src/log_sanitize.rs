const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

/// Strips terminal control sequences from one line of analyzer output.
///
/// A bare `\r` rewinds the line (progress counters), so only the text after
/// the last one survives. Tabs become a single space.
pub fn sanitize_line(input: &str) -> String {
    let input = input.trim_end_matches('\r');
    let input = input.rsplit_once('\r').map_or(input, |(_, tail)| tail);

    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc),
                (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::String),
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc, '\x07') => None,
                (Escape::Osc | Escape::OscEsc, '\x1b') => Some(Escape::OscEsc),
                (Escape::OscEsc, '\\') => None,
                (Escape::Osc | Escape::OscEsc, _) => Some(Escape::Osc),
                (Escape::String | Escape::StringEsc, '\x1b') => Some(Escape::StringEsc),
                (Escape::StringEsc, '\\') => None,
                (Escape::String | Escape::StringEsc, _) => Some(Escape::String),
            };
            continue;
        }
        match c {
            '\x1b' => escape = Some(Escape::Start),
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// Sanitizes a whole captured output block, keeping line structure and
/// dropping lines that end up empty.
pub fn sanitize_output(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split('\n') {
        let line = sanitize_line(line);
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}
