use crate::db::UntranslatedItem;

/// Split items into batches of at most `max_items` items and `max_chars`
/// characters of source text, keeping enumeration order.
///
/// An item longer than `max_chars` on its own gets a batch to itself.
pub fn group_items(
    items: Vec<UntranslatedItem>,
    max_items: usize,
    max_chars: usize,
) -> Vec<Vec<UntranslatedItem>> {
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<UntranslatedItem> = Vec::new();
    let mut current_chars = 0;

    for item in items {
        let chars = item.source_text.chars().count();

        if chars > max_chars {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            batches.push(vec![item]);
            continue;
        }

        if !current.is_empty() && (current.len() >= max_items || current_chars + chars > max_chars) {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += chars;
        current.push(item);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Union of the languages missing across a batch, sorted.
pub fn missing_languages(batch: &[UntranslatedItem]) -> Vec<String> {
    let mut langs: Vec<String> = batch
        .iter()
        .flat_map(|item| item.missing_langs.iter().cloned())
        .collect();
    langs.sort();
    langs.dedup();
    langs
}
