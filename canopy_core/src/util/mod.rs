use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::slice::Iter;
use thiserror::Error;

pub mod clock;

#[derive(Debug, Error)]
pub enum StorageError
{
    #[error("cannot access {path}: {source}")]
    Io
    {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },
    #[error("malformed json in {path}: {source}")]
    Json
    {
        path: PathBuf,
        #[source]
        source: serde_json::Error
    }
}

pub trait ObjectStorage<T>
{
    fn get_entry<P>(&self, filter: P) -> Option<T> where P: FnMut(&T) -> bool;
    fn put_entry(&mut self, entry: T);
    /// Removes every entry matching `filter`, returns how many were removed.
    fn delete_entry<P>(&mut self, filter: P) -> usize where P: FnMut(&T) -> bool;
    fn update_storage(&self) -> Result<(), StorageError>;
    fn iter(&self) -> Iter<'_, T>;
}

/// # JsonStorage
/// A list of entries kept in memory and persisted as one pretty printed
/// JSON array. A missing file is an empty list, a malformed one is an
/// error.
pub struct JsonStorage<ValueType>
{
    data: Vec<ValueType>,
    file_name: PathBuf
}

impl<ValueType> JsonStorage<ValueType> where
    ValueType: Clone + Serialize + DeserializeOwned
{
    pub fn load(file_name: impl AsRef<Path>) -> Result<Self, StorageError>
    {
        let mut ret_val = JsonStorage
        {
            data: Vec::new(),
            file_name: file_name.as_ref().to_path_buf()
        };

        ret_val.reload()?;
        Ok(ret_val)
    }

    pub fn reload(&mut self) -> Result<(), StorageError>
    {
        self.data = match File::open(&self.file_name)
        {
            Ok(file) => serde_json::from_reader(BufReader::new(file))
                            .map_err(|source| StorageError::Json { path: self.file_name.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StorageError::Io { path: self.file_name.clone(), source })
        };
        Ok(())
    }

    /// Replaces the first entry matching `filter`. Returns false if
    /// nothing matched.
    pub fn replace_entry<P>(&mut self, mut filter: P, entry: ValueType) -> bool where
        P: FnMut(&ValueType) -> bool
    {
        match self.data.iter_mut().find(|x| filter(x))
        {
            Some(slot) => { *slot = entry; true }
            None => false
        }
    }

    pub fn entries(&self) -> Vec<ValueType>
    {
        self.data.clone()
    }

    pub fn path(&self) -> &Path
    {
        &self.file_name
    }
}

impl<ValueType> ObjectStorage<ValueType> for JsonStorage<ValueType> where
    ValueType: Clone + Serialize + DeserializeOwned
{
    fn get_entry<P>(&self, mut filter: P) -> Option<ValueType> where
        P: FnMut(&ValueType) -> bool
    {
        self.data.iter().find(|x| filter(x)).cloned()
    }

    fn put_entry(&mut self, entry: ValueType)
    {
        self.data.push(entry);
    }

    fn delete_entry<P>(&mut self, mut filter: P) -> usize where
        P: FnMut(&ValueType) -> bool
    {
        let before = self.data.len();
        self.data.retain(|x| !filter(x));
        before - self.data.len()
    }

    fn update_storage(&self) -> Result<(), StorageError>
    {
        let writer = File::create(&self.file_name)
                        .map_err(|source| StorageError::Io { path: self.file_name.clone(), source })?;
        serde_json::to_writer_pretty(BufWriter::new(writer), &self.data)
            .map_err(|source| StorageError::Json { path: self.file_name.clone(), source })
    }

    fn iter(&self) -> Iter<'_, ValueType>
    {
        self.data.iter()
    }
}
