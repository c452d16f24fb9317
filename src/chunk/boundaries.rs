//! Break point detection for chunking
//!
//! All positions are byte offsets; window sizes and overlaps are counted in
//! characters. Every function returns a position that is a valid UTF-8
//! character boundary of `text`.

/// Move `pos` back to the nearest character boundary (clamped to the text length)
pub fn floor_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut adjusted = pos;
    while adjusted > 0 && !text.is_char_boundary(adjusted) {
        adjusted -= 1;
    }
    adjusted
}

/// Move `pos` forward to the nearest character boundary (clamped to the text length)
pub fn ceil_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut adjusted = pos;
    while adjusted < text.len() && !text.is_char_boundary(adjusted) {
        adjusted += 1;
    }
    adjusted
}

/// Byte offset `chars` characters after `pos` (clamped to the text length)
pub fn advance_chars(text: &str, pos: usize, chars: usize) -> usize {
    let pos = ceil_char_boundary(text, pos);
    text[pos..]
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| pos + i)
}

/// Byte offset `chars` characters before `pos` (clamped to zero)
pub fn retreat_chars(text: &str, pos: usize, chars: usize) -> usize {
    if chars == 0 {
        return floor_char_boundary(text, pos);
    }
    let pos = floor_char_boundary(text, pos);
    text[..pos]
        .char_indices()
        .rev()
        .nth(chars - 1)
        .map_or(0, |(i, _)| i)
}

/// Find the last whitespace break at or before `target`.
///
/// The returned position is the byte offset of the whitespace character, so
/// a window `[start, pos)` ends just before it. Only positions strictly
/// greater than `floor` qualify; `None` means the window has to be cut hard.
pub fn find_whitespace_break(text: &str, floor: usize, target: usize) -> Option<usize> {
    let target = floor_char_boundary(text, target);
    if target <= floor {
        return None;
    }

    // The character right at the window edge counts
    if text[target..].chars().next().is_some_and(char::is_whitespace) {
        return Some(target);
    }

    let from = ceil_char_boundary(text, floor);
    text[from..target]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, _)| from + i)
        .filter(|pos| *pos > floor)
}

/// Start of the next window: `overlap` characters before the current end
pub fn next_window_start(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    let next = retreat_chars(text, end, overlap);
    if next > start {
        next
    } else {
        end
    }
}
