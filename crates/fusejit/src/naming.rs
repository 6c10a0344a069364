/// Makes `value` a valid C identifier: non-alphanumerics become `_`, a leading digit is
/// prefixed with `_`.
pub fn sanitize_symbol(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (idx, ch) in value.chars().enumerate() {
        let is_valid = ch.is_ascii_alphanumeric() || ch == '_';
        if idx == 0 && ch.is_ascii_digit() {
            out.push('_');
        }
        out.push(if is_valid { ch } else { '_' });
    }
    if out.is_empty() {
        out.push_str("op");
    }
    out
}

/// Assigns application names from structural position only, so structurally identical graphs
/// always get identical names.
#[derive(Debug, Default)]
pub struct SymbolNamer {
    next: usize,
}

impl SymbolNamer {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn application_name(&mut self, kind_name: &str) -> String {
        let index = self.next;
        self.next += 1;
        format!("n{index}_{}", sanitize_symbol(kind_name))
    }
}

/// Identifier scoped to one application, for per-application support definitions.
pub fn scoped_symbol(application: &str, local: &str) -> String {
    format!("{application}_{}", sanitize_symbol(local))
}
