//! Staging tables for bulk loads.

use std::collections::BTreeMap;

use crate::db::Database;
use crate::load::LoadResult;
use crate::value::Value;

/// A transient staging table holding one batch before the merge.
///
/// Columns are declared without types so key values keep whatever
/// representation they were staged with.
pub struct StagingTable {
    pub name: String,
    pub columns: Vec<String>,
}

impl StagingTable {
    pub fn create(
        db: &mut dyn Database,
        entity: &str,
        columns: Vec<String>,
    ) -> LoadResult<Self> {
        let name = format!("_stage_{}_{:08x}", entity, rand::random::<u32>());
        db.execute(&format!("CREATE TABLE {} ({})", name, columns.join(", ")))?;
        Ok(Self { name, columns })
    }

    /// Render the batch as TSV in this table's column order.
    pub fn tsv(&self, data: &BTreeMap<String, Vec<Value>>, len: usize) -> String {
        let mut out = String::new();
        for row in 0..len {
            let mut first = true;
            for column in &self.columns {
                if !first {
                    out.push('\t');
                }
                first = false;
                match data.get(column) {
                    Some(values) => out.push_str(&values[row].tsv_field()),
                    None => out.push_str("\\N"),
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn drop(self, db: &mut dyn Database) -> LoadResult<()> {
        db.execute(&format!("DROP TABLE IF EXISTS {}", self.name))?;
        Ok(())
    }
}
