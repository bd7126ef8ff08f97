//! Stat identity interning and the category table.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::sample::CategoryId;

pub const MAX_CATEGORIES: usize = 64;

/// Process-wide category table with per-category enable flags.
///
/// Registration takes a short lock; the enable flags are plain atomics so
/// producer threads can check them without synchronization.
pub struct CategoryRegistry {
    names: Mutex<Vec<String>>,
    enabled: [AtomicBool; MAX_CATEGORIES],
}

impl CategoryRegistry {
    pub fn new() -> Self {
        // Index 0 is the default category; it cannot be disabled by name
        // because it has none.
        CategoryRegistry {
            names: Mutex::new(vec![String::new()]),
            enabled: std::array::from_fn(|_| AtomicBool::new(true)),
        }
    }

    pub fn register(&self, name: &str, disabled: &[String]) -> CategoryId {
        let mut names = self.names.lock();
        if let Some(index) = names.iter().position(|n| n == name) {
            return CategoryId(index as u16);
        }
        if names.len() >= MAX_CATEGORIES {
            warn!(name, "category table full, falling back to default category");
            return CategoryId::DEFAULT;
        }
        let index = names.len();
        names.push(name.to_string());
        self.enabled[index].store(
            !disabled.iter().any(|d| d == name),
            Ordering::Relaxed,
        );
        CategoryId(index as u16)
    }

    pub fn is_enabled(&self, category: CategoryId) -> bool {
        self.enabled[category.0 as usize].load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, category: CategoryId, enabled: bool) {
        self.enabled[category.0 as usize].store(enabled, Ordering::Relaxed);
    }

    pub fn name_of(&self, category: CategoryId) -> String {
        let names = self.names.lock();
        names
            .get(category.0 as usize)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense index of one interned stat identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatIndex(pub u32);

struct StatIdentity {
    name: &'static str,
    category: CategoryId,
    is_count: bool,
}

/// Interns (name, category, kind) triples into dense indices.
///
/// Stable names are keyed directly on pointer identity (the caller
/// guarantees one pointer per spelling). Non-stable names are effectively
/// ephemeral pointers to character data: two distinct pointers may carry the
/// same spelling, so before minting a new index the actual string content is
/// checked against a secondary map. Touched only by the processing thread;
/// indices are append-only for the lifetime of a capture session.
pub struct StatRegistry {
    identities: Vec<StatIdentity>,
    by_pointer: HashMap<(usize, CategoryId, bool), StatIndex>,
    by_content: HashMap<(String, CategoryId, bool), StatIndex>,
}

impl StatRegistry {
    pub fn new() -> Self {
        StatRegistry {
            identities: Vec::new(),
            by_pointer: HashMap::new(),
            by_content: HashMap::new(),
        }
    }

    pub fn intern(
        &mut self,
        name: &'static str,
        category: CategoryId,
        stable_name: bool,
        is_count: bool,
    ) -> StatIndex {
        let pointer_key = (name.as_ptr() as usize, category, is_count);
        if let Some(&index) = self.by_pointer.get(&pointer_key) {
            return index;
        }

        if !stable_name {
            let content_key = (name.to_string(), category, is_count);
            if let Some(&index) = self.by_content.get(&content_key) {
                // Same spelling through a different pointer; remember the
                // pointer for future fast lookups.
                self.by_pointer.insert(pointer_key, index);
                return index;
            }
            let index = self.mint(name, category, is_count);
            self.by_pointer.insert(pointer_key, index);
            self.by_content.insert(content_key, index);
            return index;
        }

        let index = self.mint(name, category, is_count);
        self.by_pointer.insert(pointer_key, index);
        index
    }

    fn mint(&mut self, name: &'static str, category: CategoryId, is_count: bool) -> StatIndex {
        let index = StatIndex(self.identities.len() as u32);
        self.identities.push(StatIdentity {
            name,
            category,
            is_count,
        });
        index
    }

    pub fn name_of(&self, index: StatIndex) -> &'static str {
        self.identities[index.0 as usize].name
    }

    pub fn category_of(&self, index: StatIndex) -> CategoryId {
        self.identities[index.0 as usize].category
    }

    pub fn is_count_stat(&self, index: StatIndex) -> bool {
        self.identities[index.0 as usize].is_count
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn leak(s: &str) -> &'static str {
        Box::leak(s.to_string().into_boxed_str())
    }

    #[rstest]
    fn test_same_pointer_fast_path() {
        let mut registry = StatRegistry::new();
        let name = leak("DrawCalls");
        let a = registry.intern(name, CategoryId::DEFAULT, false, false);
        let b = registry.intern(name, CategoryId::DEFAULT, false, false);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn test_identical_content_different_pointers_dedup() {
        let mut registry = StatRegistry::new();
        let a = registry.intern(leak("Particles"), CategoryId::DEFAULT, false, false);
        let b = registry.intern(leak("Particles"), CategoryId::DEFAULT, false, false);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn test_category_and_count_distinguish() {
        let mut registry = StatRegistry::new();
        let name = leak("Tris");
        let plain = registry.intern(name, CategoryId::DEFAULT, false, false);
        let categorized = registry.intern(name, CategoryId(1), false, false);
        let count = registry.intern(name, CategoryId::DEFAULT, false, true);
        assert_ne!(plain, categorized);
        assert_ne!(plain, count);
        assert!(registry.is_count_stat(count));
        assert!(!registry.is_count_stat(plain));
        assert_eq!(registry.category_of(categorized), CategoryId(1));
    }

    #[rstest]
    fn test_stable_names_skip_content_check() {
        let mut registry = StatRegistry::new();
        let name = leak("FrameTime");
        let a = registry.intern(name, CategoryId::DEFAULT, true, false);
        let b = registry.intern(name, CategoryId::DEFAULT, true, false);
        assert_eq!(a, b);
        assert_eq!(registry.name_of(a), "FrameTime");
    }

    #[rstest]
    fn test_category_registry_enable_flags() {
        let registry = CategoryRegistry::new();
        let disabled = vec!["Lighting".to_string()];
        let gfx = registry.register("Graphics", &disabled);
        let lighting = registry.register("Lighting", &disabled);
        assert!(registry.is_enabled(gfx));
        assert!(!registry.is_enabled(lighting));

        registry.set_enabled(lighting, true);
        assert!(registry.is_enabled(lighting));

        // Re-registration returns the same id.
        assert_eq!(registry.register("Graphics", &disabled), gfx);
        assert_eq!(registry.name_of(gfx), "Graphics");
    }
}
