//! Partition functions for fanning one trigger out into several buildsets.

use crate::Properties;

/// Splits a trigger into partitions, each submitted as its own buildset.
///
/// Every returned property set is overlaid onto the trigger's properties.
/// Returning no partitions means the trigger is submitted once, unchanged.
pub trait PartitionFunction: Send + Sync {
    fn name(&self) -> &str;

    fn partitions(&self, builder_names: &[String], properties: &Properties) -> Vec<Properties>;
}

/// Adapts a closure into a [`PartitionFunction`].
pub struct FnPartition<F> {
    name: String,
    f: F,
}

impl<F> FnPartition<F>
where
    F: Fn(&[String], &Properties) -> Vec<Properties> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> PartitionFunction for FnPartition<F>
where
    F: Fn(&[String], &Properties) -> Vec<Properties> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self, builder_names: &[String], properties: &Properties) -> Vec<Properties> {
        (self.f)(builder_names, properties)
    }
}
