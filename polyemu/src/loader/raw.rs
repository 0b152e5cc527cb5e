use super::{basename, ImageFormat, LoadedImage, Segment};
use crate::{
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Permission, Placement},
    utils::align_up,
    PAGE_SIZE,
};

/// Flat binary: the whole file is code and data, mapped RWX at `base` with
/// the entry point on its first byte.
pub fn load(m: &mut Machine, data: &[u8], path: &str, base: u64) -> Result<LoadedImage> {
    if data.is_empty() {
        return Err(EmulatorError::MalformedImage("empty raw image".into()));
    }
    let size = align_up(data.len() as u64, PAGE_SIZE);
    let name = basename(path).to_string();
    m.mem.map(Placement::Fixed(base), size, Permission::ALL, name.clone())?;
    m.mem.write_raw(base, data)?;
    Ok(LoadedImage {
        name,
        path: path.to_string(),
        format: ImageFormat::Raw,
        entry: base,
        base,
        size,
        segments: vec![Segment {
            address: base,
            size,
            perms: Permission::ALL,
        }],
        imports: vec![],
        exports: Default::default(),
        is_main: true,
        needed: vec![],
    })
}

#[cfg(test)]
mod test {
    use super::load;
    use crate::{
        arch::ArchType,
        engine::Machine,
        errors::EmulatorError,
        memory::{Memory, Permission},
        testing::TinyX86,
    };

    #[test]
    fn test_flat_binary() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        let image = load(&mut m, &[0xb8, 1, 0, 0, 0], "exit.bin", 0x1000).unwrap();
        assert_eq!((image.entry, image.size), (0x1000, 0x1000));
        assert_eq!(m.mem.region_at(0x1000).unwrap().perms, Permission::ALL);
        assert_eq!(Memory::read(&m, 0x1004, 2).unwrap(), vec![0, 0]);
        assert!(matches!(
            load(&mut m, &[], "empty", 0x8000),
            Err(EmulatorError::MalformedImage(_))
        ));
    }
}
