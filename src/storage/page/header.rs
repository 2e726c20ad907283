use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::PageId;
use crate::storage::page::error::PageError;

// Directory layout: a u32 byte length followed by a bincode-encoded
// name -> root_page_id map. A zeroed page decodes as an empty directory.
const LEN_PREFIX_SIZE: usize = 4;

/// View over the header page (page 0). It carries the persistent mapping
/// from index name to root page id; every root change of an index must go
/// through here while the page is pinned.
pub struct HeaderPage<B> {
    buf: B,
}

impl<B> HeaderPage<B>
where
    B: Deref<Target = [u8]>,
{
    pub fn view(buf: B) -> Self {
        Self { buf }
    }

    /// Root page id recorded for `name`, if any.
    pub fn get_record(&self, name: &str) -> Result<Option<PageId>, PageError> {
        Ok(self.records()?.get(name).copied())
    }

    pub fn record_count(&self) -> Result<usize, PageError> {
        Ok(self.records()?.len())
    }

    fn records(&self) -> Result<BTreeMap<String, PageId>, PageError> {
        let len = LittleEndian::read_u32(&self.buf[0..LEN_PREFIX_SIZE]) as usize;
        if len == 0 {
            return Ok(BTreeMap::new());
        }
        if LEN_PREFIX_SIZE + len > self.buf.len() {
            return Err(PageError::Serialization(
                "header directory length exceeds page".to_string(),
            ));
        }
        bincode::deserialize(&self.buf[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len])
            .map_err(|e| PageError::Serialization(e.to_string()))
    }
}

impl<B> HeaderPage<B>
where
    B: Deref<Target = [u8]> + DerefMut,
{
    /// Add a record for a new index. Returns false if the name is taken.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool, PageError> {
        let mut records = self.records()?;
        if records.contains_key(name) {
            return Ok(false);
        }
        records.insert(name.to_string(), root_page_id);
        self.write_records(&records)?;
        Ok(true)
    }

    /// Update an existing record. Returns false if the name is unknown.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool, PageError> {
        let mut records = self.records()?;
        match records.get_mut(name) {
            Some(root) => *root = root_page_id,
            None => return Ok(false),
        }
        self.write_records(&records)?;
        Ok(true)
    }

    fn write_records(&mut self, records: &BTreeMap<String, PageId>) -> Result<(), PageError> {
        let encoded =
            bincode::serialize(records).map_err(|e| PageError::Serialization(e.to_string()))?;
        if LEN_PREFIX_SIZE + encoded.len() > self.buf.len() {
            return Err(PageError::InsufficientSpace);
        }
        LittleEndian::write_u32(&mut self.buf[0..LEN_PREFIX_SIZE], encoded.len() as u32);
        self.buf[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::PAGE_SIZE;

    #[test]
    fn test_empty_page_has_no_records() {
        let buf = vec![0u8; PAGE_SIZE];
        let header = HeaderPage::view(&buf[..]);
        assert_eq!(header.get_record("orders_pk").unwrap(), None);
        assert_eq!(header.record_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = HeaderPage::view(&mut buf[..]);
        assert!(header.insert_record("orders_pk", 7).unwrap());
        assert!(!header.insert_record("orders_pk", 9).unwrap());

        let header = HeaderPage::view(&buf[..]);
        assert_eq!(header.get_record("orders_pk").unwrap(), Some(7));
    }

    #[test]
    fn test_update_existing() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = HeaderPage::view(&mut buf[..]);
        assert!(header.insert_record("idx", 3).unwrap());
        assert!(header.update_record("idx", 11).unwrap());
        assert!(!header.update_record("missing", 11).unwrap());
        assert_eq!(header.get_record("idx").unwrap(), Some(11));
    }

    #[test]
    fn test_multiple_indexes() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = HeaderPage::view(&mut buf[..]);
        for i in 0..10 {
            assert!(header.insert_record(&format!("index_{}", i), i).unwrap());
        }
        let header = HeaderPage::view(&buf[..]);
        assert_eq!(header.record_count().unwrap(), 10);
        assert_eq!(header.get_record("index_4").unwrap(), Some(4));
    }
}
