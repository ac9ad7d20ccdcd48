use bitflags::bitflags;

bitflags! {
    /// Usage bits a buffer was created with.
    ///
    /// The capture pass needs these to decide how a buffer's contents can be
    /// read back (transfer source) and whether the buffer participates in
    /// device addressing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const SHADER_DEVICE_ADDRESS = 1 << 6;
        const ACCEL_STRUCTURE_STORAGE = 1 << 7;
        const ACCEL_STRUCTURE_INPUT = 1 << 8;
    }
}
