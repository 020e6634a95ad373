//! # Price File
//!
//! The company's authoritative price table, one `commodity,price` line per
//! grade. A missing file means "use the built-in defaults".

use std::path::{Path, PathBuf};

use fuelnet_core::{Commodity, Price, PriceTable};
use tracing::debug;

use crate::error::StoreResult;
use crate::flatfile;

#[derive(Debug, Clone)]
pub struct PriceFile {
    path: PathBuf,
}

impl PriceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PriceFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the table on top of `defaults`.
    ///
    /// Grades missing from the file keep their default; malformed lines are
    /// skipped.
    pub fn load_or(&self, defaults: PriceTable) -> StoreResult<PriceTable> {
        let mut table = defaults;
        for line in flatfile::read_lines(&self.path)? {
            let parsed = line.split_once(',').and_then(|(name, price)| {
                let commodity = name.parse::<Commodity>().ok()?;
                let price = price.parse::<Price>().ok()?;
                Some((commodity, price))
            });
            match parsed {
                Some((commodity, price)) => {
                    table.set(commodity, price);
                }
                None => debug!(%line, "Skipping malformed price line"),
            }
        }
        Ok(table)
    }

    pub fn save(&self, table: &PriceTable) -> StoreResult<()> {
        flatfile::write_lines_atomic(
            &self.path,
            table.iter().map(|(c, p)| format!("{},{}", c, p)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = PriceFile::new(dir.path().join("company_prices.txt"));
        assert_eq!(
            file.load_or(PriceTable::company_defaults()).unwrap(),
            PriceTable::company_defaults()
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = PriceFile::new(dir.path().join("company_prices.txt"));

        let mut table = PriceTable::company_defaults();
        table.set(Commodity::Diesel, Price::from_whole(950));
        file.save(&table).unwrap();

        let loaded = file.load_or(PriceTable::default()).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("company_prices.txt");
        flatfile::write_lines_atomic(&path, ["diesel,990.5", "95,nope"]).unwrap();

        let table = PriceFile::new(&path)
            .load_or(PriceTable::company_defaults())
            .unwrap();
        assert_eq!(table.get(Commodity::Diesel), Some("990.5".parse().unwrap()));
        assert_eq!(table.get(Commodity::Gasoline95), Some(Price::from_whole(110)));
    }
}
