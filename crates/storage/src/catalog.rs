use std::collections::HashMap;
use std::sync::Arc;

use quarry_common::{QuarryError, Result};
use quarry_execution::{ExecNode, TableSource};
use quarry_planner::PlanningContext;

use crate::provider::TableProvider;

/// Name → provider registry shared by the planner and every worker.
#[derive(Default, Clone)]
pub struct Catalog {
    tables: HashMap<String, Arc<dyn TableProvider>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace `name`.
    pub fn register_table(&mut self, name: impl Into<String>, table: Arc<dyn TableProvider>) {
        self.tables.insert(name.into(), table);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn TableProvider>> {
        self.tables
            .get(name)
            .ok_or_else(|| QuarryError::Planning(format!("unknown table: {name}")))
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PlanningContext for Catalog {
    fn table_partitions(&self, table: &str) -> Result<usize> {
        Ok(self.get(table)?.partition_count())
    }
}

impl TableSource for Catalog {
    fn scan(
        &self,
        table: &str,
        partition: usize,
        projection: Option<&[String]>,
    ) -> Result<Arc<dyn ExecNode>> {
        self.get(table)?.scan(partition, projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemTable;
    use arrow_schema::{DataType, Field, Schema};

    #[test]
    fn resolves_partitions_and_rejects_unknown_tables() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let mut cat = Catalog::new();
        cat.register_table(
            "t",
            Arc::new(MemTable::try_new(schema, vec![vec![], vec![], vec![]]).unwrap()),
        );
        assert_eq!(cat.table_partitions("t").unwrap(), 3);
        assert!(matches!(
            cat.table_partitions("u"),
            Err(QuarryError::Planning(_))
        ));
        assert_eq!(cat.table_names(), vec!["t".to_string()]);
    }
}
