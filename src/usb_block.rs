//! Binary layout of the data blocks delivered by the acquisition board.
//!
//! This is a hard external contract: the board firmware packs samples this
//! way and everything downstream (decode, disk, TCP) depends on it
//! bit-exactly. All fields are little-endian.
//!
//! Per data block: `USB_BLOCK_MAGIC: u64`, then `FRAMES_PER_BLOCK` frames.
//! Per frame: `timestamp: u32`, then for each enabled stream 32 amplifier
//! words, 3 auxiliary words, and 1 supply-voltage word (stim controllers
//! add 32 DC-amplifier words and 32 stim-marker words per stream), then 8
//! board ADC words, 8 board DAC words (stim controllers only), and the
//! digital input and output words.

use byteorder::{ByteOrder, LittleEndian};

use crate::api::{
    ControllerKind, AUX_PER_STREAM, CHANNELS_PER_STREAM, FRAMES_PER_BLOCK, NUM_BOARD_ADCS,
    NUM_BOARD_DACS, USB_BLOCK_MAGIC,
};

pub const MAGIC_BYTES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    kind: ControllerKind,
    num_streams: usize,
}

impl BlockLayout {
    pub fn new(kind: ControllerKind, num_streams: usize) -> BlockLayout {
        BlockLayout { kind, num_streams }
    }

    pub fn kind(&self) -> ControllerKind { self.kind }
    pub fn num_streams(&self) -> usize { self.num_streams }

    fn words_per_stream(&self) -> usize {
        let base = CHANNELS_PER_STREAM + AUX_PER_STREAM + 1;
        if self.kind.has_dc_amplifiers() { base + 2 * CHANNELS_PER_STREAM } else { base }
    }

    fn board_words(&self) -> usize {
        let dacs = if self.kind.has_dc_amplifiers() { NUM_BOARD_DACS } else { 0 };
        NUM_BOARD_ADCS + dacs + 2
    }

    pub fn bytes_per_frame(&self) -> usize {
        4 + 2 * (self.num_streams * self.words_per_stream() + self.board_words())
    }

    pub fn bytes_per_block(&self) -> usize {
        MAGIC_BYTES + FRAMES_PER_BLOCK * self.bytes_per_frame()
    }

    fn frame_offset(&self, frame: usize) -> usize {
        MAGIC_BYTES + frame * self.bytes_per_frame()
    }

    fn stream_offset(&self, frame: usize, stream: usize) -> usize {
        debug_assert!(stream < self.num_streams);
        self.frame_offset(frame) + 4 + 2 * stream * self.words_per_stream()
    }

    fn board_offset(&self, frame: usize) -> usize {
        self.frame_offset(frame) + 4 + 2 * self.num_streams * self.words_per_stream()
    }
}

/// Read-only access to one block in a raw byte buffer.
pub struct BlockView<'a> {
    layout: BlockLayout,
    data: &'a [u8],
}

impl<'a> BlockView<'a> {
    /// Checks length and magic; a mismatch means the USB stream de-synced.
    pub fn new(layout: BlockLayout, data: &'a [u8]) -> Option<BlockView<'a>> {
        if data.len() < layout.bytes_per_block() {
            return None;
        }
        if LittleEndian::read_u64(&data[0..8]) != USB_BLOCK_MAGIC {
            return None;
        }
        Some(BlockView { layout, data })
    }

    pub fn timestamp(&self, frame: usize) -> u32 {
        LittleEndian::read_u32(&self.data[self.layout.frame_offset(frame)..])
    }

    pub fn amp(&self, frame: usize, stream: usize, channel: usize) -> u16 {
        debug_assert!(channel < CHANNELS_PER_STREAM);
        let off = self.layout.stream_offset(frame, stream) + 2 * channel;
        LittleEndian::read_u16(&self.data[off..])
    }

    pub fn aux(&self, frame: usize, stream: usize, slot: usize) -> u16 {
        debug_assert!(slot < AUX_PER_STREAM);
        let off = self.layout.stream_offset(frame, stream) + 2 * (CHANNELS_PER_STREAM + slot);
        LittleEndian::read_u16(&self.data[off..])
    }

    pub fn supply_voltage(&self, frame: usize, stream: usize) -> u16 {
        let off =
            self.layout.stream_offset(frame, stream) + 2 * (CHANNELS_PER_STREAM + AUX_PER_STREAM);
        LittleEndian::read_u16(&self.data[off..])
    }

    pub fn dc_amp(&self, frame: usize, stream: usize, channel: usize) -> u16 {
        debug_assert!(self.layout.kind.has_dc_amplifiers());
        let off = self.layout.stream_offset(frame, stream)
            + 2 * (CHANNELS_PER_STREAM + AUX_PER_STREAM + 1 + channel);
        LittleEndian::read_u16(&self.data[off..])
    }

    pub fn stim_word(&self, frame: usize, stream: usize, channel: usize) -> u16 {
        debug_assert!(self.layout.kind.has_dc_amplifiers());
        let off = self.layout.stream_offset(frame, stream)
            + 2 * (2 * CHANNELS_PER_STREAM + AUX_PER_STREAM + 1 + channel);
        LittleEndian::read_u16(&self.data[off..])
    }

    pub fn adc(&self, frame: usize, channel: usize) -> u16 {
        debug_assert!(channel < NUM_BOARD_ADCS);
        LittleEndian::read_u16(&self.data[self.layout.board_offset(frame) + 2 * channel..])
    }

    pub fn dac(&self, frame: usize, channel: usize) -> u16 {
        debug_assert!(self.layout.kind.has_dc_amplifiers());
        let off = self.layout.board_offset(frame) + 2 * (NUM_BOARD_ADCS + channel);
        LittleEndian::read_u16(&self.data[off..])
    }

    fn digital_offset(&self, frame: usize) -> usize {
        let dacs = if self.layout.kind.has_dc_amplifiers() { NUM_BOARD_DACS } else { 0 };
        self.layout.board_offset(frame) + 2 * (NUM_BOARD_ADCS + dacs)
    }

    pub fn digital_in(&self, frame: usize) -> u16 {
        LittleEndian::read_u16(&self.data[self.digital_offset(frame)..])
    }

    pub fn digital_out(&self, frame: usize) -> u16 {
        LittleEndian::read_u16(&self.data[self.digital_offset(frame) + 2..])
    }
}

/// Write access used by the synthetic board (and block-format tests).
pub struct BlockBuilder {
    layout: BlockLayout,
    data: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(layout: BlockLayout) -> BlockBuilder {
        let mut data = vec![0u8; layout.bytes_per_block()];
        LittleEndian::write_u64(&mut data[0..8], USB_BLOCK_MAGIC);
        BlockBuilder { layout, data }
    }

    pub fn set_timestamp(&mut self, frame: usize, value: u32) {
        let off = self.layout.frame_offset(frame);
        LittleEndian::write_u32(&mut self.data[off..off + 4], value);
    }

    pub fn set_amp(&mut self, frame: usize, stream: usize, channel: usize, value: u16) {
        let off = self.layout.stream_offset(frame, stream) + 2 * channel;
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_aux(&mut self, frame: usize, stream: usize, slot: usize, value: u16) {
        let off = self.layout.stream_offset(frame, stream) + 2 * (CHANNELS_PER_STREAM + slot);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_supply_voltage(&mut self, frame: usize, stream: usize, value: u16) {
        let off =
            self.layout.stream_offset(frame, stream) + 2 * (CHANNELS_PER_STREAM + AUX_PER_STREAM);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_dc_amp(&mut self, frame: usize, stream: usize, channel: usize, value: u16) {
        let off = self.layout.stream_offset(frame, stream)
            + 2 * (CHANNELS_PER_STREAM + AUX_PER_STREAM + 1 + channel);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_stim_word(&mut self, frame: usize, stream: usize, channel: usize, value: u16) {
        let off = self.layout.stream_offset(frame, stream)
            + 2 * (2 * CHANNELS_PER_STREAM + AUX_PER_STREAM + 1 + channel);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_adc(&mut self, frame: usize, channel: usize, value: u16) {
        let off = self.layout.board_offset(frame) + 2 * channel;
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_dac(&mut self, frame: usize, channel: usize, value: u16) {
        let off = self.layout.board_offset(frame) + 2 * (NUM_BOARD_ADCS + channel);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_digital_in(&mut self, frame: usize, value: u16) {
        let dacs = if self.layout.kind.has_dc_amplifiers() { NUM_BOARD_DACS } else { 0 };
        let off = self.layout.board_offset(frame) + 2 * (NUM_BOARD_ADCS + dacs);
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn set_digital_out(&mut self, frame: usize, value: u16) {
        let dacs = if self.layout.kind.has_dc_amplifiers() { NUM_BOARD_DACS } else { 0 };
        let off = self.layout.board_offset(frame) + 2 * (NUM_BOARD_ADCS + dacs) + 2;
        LittleEndian::write_u16(&mut self.data[off..off + 2], value);
    }

    pub fn as_bytes(&self) -> &[u8] { &self.data }

    pub fn into_bytes(self) -> Vec<u8> { self.data }
}
