//! The process-global allocator registry, modelled as a first-class service
//! rather than an ambient global: the Subnet controller is its sole writer,
//! the Pod controller only reads and then mutates individual allocators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::subnet_allocator::SubnetAllocator;

#[derive(Debug, Default, Clone)]
pub struct AllocatorRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<SubnetAllocator>>>>,
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subnet_name: impl Into<String>, allocator: Arc<SubnetAllocator>) {
        self.inner.write().insert(subnet_name.into(), allocator);
    }

    pub fn remove(&self, subnet_name: &str) -> Option<Arc<SubnetAllocator>> {
        self.inner.write().remove(subnet_name)
    }

    pub fn get(&self, subnet_name: &str) -> Option<Arc<SubnetAllocator>> {
        self.inner.read().get(subnet_name).cloned()
    }

    pub fn contains(&self, subnet_name: &str) -> bool {
        self.inner.read().contains_key(subnet_name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::subnet_allocator::SubnetAllocator;

    #[test]
    fn insert_get_remove_roundtrip() {
        let registry = AllocatorRegistry::new();
        let alloc = Arc::new(
            SubnetAllocator::new("s1", "10.244.1.0/24".parse().unwrap(), &[]).unwrap(),
        );
        registry.insert("s1", alloc.clone());
        assert!(registry.contains("s1"));
        assert!(registry.get("s1").is_some());
        registry.remove("s1");
        assert!(!registry.contains("s1"));
    }

    #[test]
    fn clones_share_the_same_backing_map() {
        let registry = AllocatorRegistry::new();
        let other = registry.clone();
        let alloc = Arc::new(
            SubnetAllocator::new("s1", "10.244.1.0/24".parse().unwrap(), &[]).unwrap(),
        );
        registry.insert("s1", alloc);
        assert!(other.contains("s1"));
    }
}
