//! Inline `style` attribute handling.

/// A single `property: value` pair from an inline style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

/// An inline style kept in source order, so re-serialization is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineStyle {
    declarations: Vec<Declaration>,
}

impl InlineStyle {
    /// Parse a `style` attribute value. Fragments without a `:` are dropped.
    pub fn parse(input: &str) -> Self {
        let mut style = InlineStyle::default();
        for part in input.split(';') {
            let Some((property, value)) = part.split_once(':') else {
                continue;
            };
            let property = property.trim();
            if property.is_empty() {
                continue;
            }
            style.set(property, value.trim());
        }
        style
    }

    /// Upsert `property`, keeping its original position; an empty `value` deletes it.
    pub fn set(&mut self, property: &str, value: &str) {
        if value.is_empty() {
            self.declarations.retain(|d| d.property != property);
            return;
        }
        match self.declarations.iter_mut().find(|d| d.property == property) {
            Some(existing) => existing.value = value.to_string(),
            None => self.declarations.push(Declaration {
                property: property.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn get(&self, property: &str) -> Option<&str> {
        self.declarations
            .iter()
            .find(|d| d.property == property)
            .map(|d| d.value.as_str())
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

impl std::fmt::Display for InlineStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, d) in self.declarations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", d.property, d.value)?;
        }
        Ok(())
    }
}
