//! Validation of the block move that self-relocating depackers perform before unpacking.
//!
//! A typical depacker starts by moving the packed data out of the way with `LD HL,source;
//! LD DE,target; LD BC,size; LDIR` (or `LDDR`). The parameters are read from the depacker image
//! and must describe a move that fits into the 64 KiB address space.


use from_to_repr::from_to_other;


#[derive(Clone, Copy, Debug)]
#[from_to_other(base_type = u8, derive_compare = "as_int")]
pub enum MoveOpcode {
    /// `LDIR`: addresses are the first bytes of the blocks, copying upwards.
    Ldir = 0xB0,

    /// `LDDR`: addresses are the last bytes of the blocks, copying downwards.
    Lddr = 0xB8,

    Other(u8),
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DataMovement {
    pub source: u16,
    pub target: u16,
    pub size: u16,
    pub opcode: MoveOpcode,
}
impl DataMovement {
    pub fn new(source: u16, target: u16, size: u16, opcode: u8) -> Self {
        Self {
            source,
            target,
            size,
            opcode: MoveOpcode::from_base_type(opcode),
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        let source = u32::from(self.source);
        let target = u32::from(self.target);
        let size = u32::from(self.size);
        match self.opcode {
            MoveOpcode::Ldir => {
                // an upward copy must not overwrite source bytes it has yet to read
                source + size <= 0x10000
                    && target + size <= 0x10000
                    && (target < source || target >= source + size)
            },
            MoveOpcode::Lddr => {
                source + 1 >= size
                    && target + 1 >= size
                    && (target > source || target + size <= source)
            },
            MoveOpcode::Other(_) => false,
        }
    }

    /// Address of the lowest byte written by the move.
    pub fn first_of_moved_data(&self) -> u16 {
        match self.opcode {
            MoveOpcode::Lddr => self.target.wrapping_sub(self.size).wrapping_add(1),
            _ => self.target,
        }
    }

    /// Address of the highest byte written by the move.
    pub fn last_of_moved_data(&self) -> u16 {
        match self.opcode {
            MoveOpcode::Lddr => self.target,
            _ => self.target.wrapping_add(self.size).wrapping_sub(1),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{DataMovement, MoveOpcode};

    #[test]
    fn test_lddr_to_top_of_memory() {
        let movement = DataMovement::new(0xA15B, 0xFFFF, 0x2B93, 0xB8);
        assert_eq!(movement.opcode, MoveOpcode::Lddr);
        assert!(movement.is_valid());
        assert_eq!(movement.first_of_moved_data(), 0xD46D);
        assert_eq!(movement.last_of_moved_data(), 0xFFFF);
    }

    #[test]
    fn test_ldir_downwards() {
        let movement = DataMovement::new(0x6A32, 0x61A7, 0x0815, 0xB0);
        assert!(movement.is_valid());
        assert_eq!(movement.first_of_moved_data(), 0x61A7);
        assert_eq!(movement.last_of_moved_data(), 0x69BB);
    }

    #[test]
    fn test_rejections() {
        // zero size
        assert!(!DataMovement::new(0x8000, 0x9000, 0, 0xB0).is_valid());
        // unknown opcode
        assert!(!DataMovement::new(0x8000, 0x9000, 0x10, 0xA0).is_valid());
        // runs past the end of memory
        assert!(!DataMovement::new(0xFFF0, 0x8000, 0x20, 0xB0).is_valid());
        // upward copy into its own tail
        assert!(!DataMovement::new(0x8000, 0x8010, 0x20, 0xB0).is_valid());
        // downward copy below address zero
        assert!(!DataMovement::new(0x0010, 0x8000, 0x20, 0xB8).is_valid());
        // downward copy into its own head
        assert!(!DataMovement::new(0x8020, 0x8010, 0x20, 0xB8).is_valid());
    }
}
