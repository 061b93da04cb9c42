//! Symbol resolution for human-readable reports. The analysis engines work
//! on numeric ids; only the report writers and the dump tool come through
//! here.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::core::types::{split_instruction_id, ImageInfo, BLOCK_ADDRESS_TAG};

/// Which region an allocation block lives in. The packed address id only
/// carries the block tag bit, so callers that still hold the trace entry
/// pass the region along for nicer labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRegion {
    Heap,
    Stack,
}

/// Symbols of one image, loaded from a MAP file: the first non-comment line
/// names the image, every following line is `<hex offset> <symbol>`.
#[derive(Default)]
struct MapFile {
    symbols: BTreeMap<u32, String>,
}

impl MapFile {
    /// Nearest symbol at or below the offset, with the remaining delta.
    fn lookup(&self, offset: u32) -> Option<(&str, u32)> {
        self.symbols
            .range(..=offset)
            .next_back()
            .map(|(base, name)| (name.as_str(), offset - base))
    }
}

#[derive(Default)]
pub struct SymbolResolver {
    images: HashMap<i32, ImageInfo>,
    maps: HashMap<String, MapFile>,
}

impl SymbolResolver {
    pub fn new() -> SymbolResolver {
        SymbolResolver::default()
    }

    pub fn add_image(&mut self, image: ImageInfo) {
        self.images.insert(image.id, image);
    }

    pub fn image(&self, id: i32) -> Option<&ImageInfo> {
        self.images.get(&id)
    }

    /// Loads the `images.txt` sidecar: one `<id>\t<name>[\t<size>]` per line.
    pub fn load_images(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read image table {}", path.display()))?;
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let id: i32 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .with_context(|| format!("bad image id on line {} of {}", number + 1, path.display()))?;
            let name = match fields.next() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => bail!("missing image name on line {} of {}", number + 1, path.display()),
            };
            let size: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
            self.add_image(ImageInfo { id, name, size });
        }
        Ok(())
    }

    pub fn load_map_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read map file {}", path.display()))?;
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        let image_name = match lines.next() {
            Some(name) => name.to_string(),
            None => bail!("map file {} is empty", path.display()),
        };
        let mut map = MapFile::default();
        for line in lines {
            let (offset, symbol) = match line.split_once(char::is_whitespace) {
                Some(parts) => parts,
                None => continue,
            };
            let offset = u32::from_str_radix(offset.trim_start_matches("0x"), 16)
                .with_context(|| format!("bad offset {:?} in {}", offset, path.display()))?;
            map.symbols.insert(offset, symbol.trim().to_string());
        }
        debug!(
            "loaded {} symbols for image {} from {}",
            map.symbols.len(),
            image_name,
            path.display()
        );
        self.maps.insert(image_name, map);
        Ok(())
    }

    /// Loads every `*.map` file in a directory.
    pub fn load_map_directory(&mut self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)
            .with_context(|| format!("failed to list map directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "map") {
                self.load_map_file(&path)?;
            }
        }
        Ok(())
    }

    /// Formats a code location: `image!symbol+0x<delta>` when a MAP file
    /// covers it, `image:0x<offset>` otherwise.
    pub fn format_instruction(&self, instruction_id: u64) -> String {
        let (image_id, offset) = split_instruction_id(instruction_id);
        let image = match self.images.get(&image_id) {
            Some(image) => image,
            None => return format!("image{}:{:#x}", image_id, offset),
        };
        match self.maps.get(&image.name).and_then(|m| m.lookup(offset)) {
            Some((symbol, 0)) => format!("{}!{}", image.name, symbol),
            Some((symbol, delta)) => format!("{}!{}+{:#x}", image.name, symbol, delta),
            None => format!("{}:{:#x}", image.name, offset),
        }
    }

    /// Formats a data address id: allocation-block-relative addresses become
    /// `block#<id>+0x<offset>`, image-relative ones go through the image
    /// table.
    pub fn format_address(&self, address_id: u64) -> String {
        self.format_address_in(address_id, None)
    }

    /// Like [`SymbolResolver::format_address`], labelling the block with its
    /// region (`heap#`/`stack#`) when the caller still knows it.
    pub fn format_address_in(&self, address_id: u64, region: Option<BlockRegion>) -> String {
        if address_id & BLOCK_ADDRESS_TAG != 0 {
            let high = (address_id >> 32) as u32;
            let block = if high == u32::MAX {
                -1
            } else {
                (high & 0x7FFF_FFFF) as i32
            };
            let label = match region {
                Some(BlockRegion::Heap) => "heap",
                Some(BlockRegion::Stack) => "stack",
                None => "block",
            };
            return format!("{}#{}+{:#x}", label, block, address_id as u32);
        }
        self.format_instruction(address_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{block_address_id, image_address_id, instruction_id};
    use std::io::Write;

    fn resolver_with_image() -> SymbolResolver {
        let mut resolver = SymbolResolver::new();
        resolver.add_image(ImageInfo {
            id: 1,
            name: "target.js".to_string(),
            size: 4096,
        });
        resolver
    }

    #[test]
    fn unknown_images_fall_back_to_numeric_labels() {
        let resolver = SymbolResolver::new();
        assert_eq!(resolver.format_instruction(instruction_id(7, 0x42)), "image7:0x42");
    }

    #[test]
    fn map_symbols_resolve_nearest_below() {
        let mut resolver = resolver_with_image();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.map");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "target.js").unwrap();
        writeln!(file, "10 encrypt").unwrap();
        writeln!(file, "80 decrypt").unwrap();
        drop(file);
        resolver.load_map_file(&path).unwrap();

        assert_eq!(resolver.format_instruction(instruction_id(1, 0x10)), "target.js!encrypt");
        assert_eq!(
            resolver.format_instruction(instruction_id(1, 0x24)),
            "target.js!encrypt+0x14"
        );
        assert_eq!(
            resolver.format_instruction(instruction_id(1, 0x80)),
            "target.js!decrypt"
        );
        assert_eq!(resolver.format_instruction(instruction_id(1, 0x8)), "target.js:0x8");
    }

    #[test]
    fn block_addresses_format_with_block_ids() {
        let resolver = resolver_with_image();
        assert_eq!(resolver.format_address(block_address_id(3, 0x20)), "block#3+0x20");
        assert_eq!(resolver.format_address(block_address_id(-1, 0x8)), "block#-1+0x8");
        assert_eq!(resolver.format_address(image_address_id(1, 0x100)), "target.js:0x100");
    }

    #[test]
    fn block_regions_label_heap_and_stack() {
        let resolver = resolver_with_image();
        assert_eq!(
            resolver.format_address_in(block_address_id(3, 0x20), Some(BlockRegion::Heap)),
            "heap#3+0x20"
        );
        assert_eq!(
            resolver.format_address_in(block_address_id(-1, 0x8), Some(BlockRegion::Stack)),
            "stack#-1+0x8"
        );
        // Image addresses ignore the hint.
        assert_eq!(
            resolver.format_address_in(image_address_id(1, 0x100), Some(BlockRegion::Heap)),
            "target.js:0x100"
        );
    }

    #[test]
    fn image_table_loads_from_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.txt");
        std::fs::write(&path, "0\tmain.js\t123\n1\tlib.js\n").unwrap();
        let mut resolver = SymbolResolver::new();
        resolver.load_images(&path).unwrap();
        assert_eq!(resolver.image(0).unwrap().size, 123);
        assert_eq!(resolver.image(1).unwrap().name, "lib.js");
    }
}
