// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Software model of the Sercos controller: plain-RAM implementation of
//! the [`Hal`] seam with the multi-buffer exchange semantics. Drives the
//! whole test suite and doubles as a reference for real register HALs.

use super::constant::{Port, RX_RAM_SIZE, TX_RAM_SIZE};
use super::hal::{DmaDirection, Hal, RxDescType, TxDescType, DMA_CHANNELS};
use byteorder::{ByteOrder, LittleEndian};

const DESC_TEL_OFFSET_MASK: u32 = 0x0000_0FFF;
const DESC_TYPE_SHIFT: u32 = 12;
const DESC_BUF_OFFSET_SHIFT: u32 = 16;
const DESC_BUF_SELECT_SHIFT: u32 = 30;

fn rx_desc_code(kind: RxDescType) -> u32 {
    match kind {
        RxDescType::SvcStart => 0x0,
        RxDescType::SvcEnd => 0x1,
        RxDescType::RtdStart => 0x2,
        RxDescType::RtdEnd => 0x3,
        RxDescType::FcsPos => 0x4,
        RxDescType::PortRelDfdStart => 0x5,
        RxDescType::PortRelDfdEnd => 0x6,
        RxDescType::PortRelCcDfdStart => 0x7,
        RxDescType::PortRelCcDfdEnd => 0x8,
    }
}

fn tx_desc_code(kind: TxDescType) -> u32 {
    match kind {
        TxDescType::SvcStart => 0x0,
        TxDescType::SvcEnd => 0x1,
        TxDescType::RtdStart => 0x2,
        TxDescType::RtdEnd => 0x3,
        TxDescType::FcsPos => 0x4,
        TxDescType::PortRelStart => 0x5,
        TxDescType::PortRelEnd => 0x6,
        TxDescType::PortRelCcStart => 0x7,
        TxDescType::PortRelCcEnd => 0x8,
    }
}

fn pack_descriptor(buf_offset: u16, buf_select: u16, tel_offset: u16, code: u32) -> u32 {
    (u32::from(tel_offset) & DESC_TEL_OFFSET_MASK)
        | (code << DESC_TYPE_SHIFT)
        | (u32::from(buf_offset) << DESC_BUF_OFFSET_SHIFT)
        | (u32::from(buf_select) << DESC_BUF_SELECT_SHIFT)
}

/// A decoded descriptor record, for inspection by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescRecord {
    pub buf_offset: u16,
    pub buf_select: u16,
    pub tel_offset: u16,
    pub type_code: u8,
}

impl DescRecord {
    fn unpack(raw: u32) -> DescRecord {
        DescRecord {
            buf_offset: ((raw >> DESC_BUF_OFFSET_SHIFT) & 0x3FFF) as u16,
            buf_select: ((raw >> DESC_BUF_SELECT_SHIFT) & 0x3) as u16,
            tel_offset: (raw & DESC_TEL_OFFSET_MASK) as u16,
            type_code: ((raw >> DESC_TYPE_SHIFT) & 0xF) as u8,
        }
    }
}

/// Software Sercos FPGA.
pub struct SoftFpga {
    pub rx_ram: Vec<u8>,
    pub tx_ram: Vec<u8>,
    rx_base_ptr: Vec<u32>,
    tx_base_ptr: Vec<u32>,
    rx_desc_table_offset: u16,
    tx_desc_table_offset: u16,
    tgsr: [u32; 2],
    rxbuftv: u32,
    rx_new_data: (bool, bool),
    usable_tx: usize,
    usable_rx: [usize; 2],
    tx_buffer_count: usize,
    rx_buffer_count: usize,
    pub tx_buffer_requests: u32,
    pub rx_buffer_requests: u32,
    tsref: u16,
    irq: u32,
    svc_timeouts: (u16, u16),
    svc_trigger_port: Port,
    svc_last_at: usize,
    svc_redundancy: bool,
    dma_started_rx: u16,
    dma_started_tx: u16,
    dma_local: [[u32; DMA_CHANNELS]; 2],
    dma_host: [[u32; DMA_CHANNELS]; 2],
    dma_count: [[u32; DMA_CHANNELS]; 2],
    dma_rdy: [[u32; DMA_CHANNELS]; 2],
}

impl std::fmt::Debug for SoftFpga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftFpga")
            .field("usable_tx", &self.usable_tx)
            .field("usable_rx", &self.usable_rx)
            .field("tgsr", &self.tgsr)
            .field("rxbuftv", &self.rxbuftv)
            .field("tsref", &self.tsref)
            .finish()
    }
}

impl Default for SoftFpga {
    fn default() -> Self {
        SoftFpga::new()
    }
}

impl SoftFpga {
    /// Single-buffered controller, the common test configuration.
    pub fn new() -> SoftFpga {
        SoftFpga::with_buffers(1, 1)
    }

    pub fn with_buffers(tx_count: usize, rx_count: usize) -> SoftFpga {
        SoftFpga {
            rx_ram: vec![0; RX_RAM_SIZE as usize],
            tx_ram: vec![0; TX_RAM_SIZE as usize],
            rx_base_ptr: vec![0; super::hal::RX_BASE_PTR_NBR],
            tx_base_ptr: vec![0; super::hal::TX_BASE_PTR_NBR],
            rx_desc_table_offset: 0,
            tx_desc_table_offset: 0,
            tgsr: [0; 2],
            rxbuftv: 0,
            rx_new_data: (false, false),
            usable_tx: 0,
            usable_rx: [0; 2],
            tx_buffer_count: tx_count,
            rx_buffer_count: rx_count,
            tx_buffer_requests: 0,
            rx_buffer_requests: 0,
            tsref: 0,
            irq: 0,
            svc_timeouts: (0, 0),
            svc_trigger_port: Port::Port1,
            svc_last_at: 0,
            svc_redundancy: false,
            dma_started_rx: 0,
            dma_started_tx: 0,
            dma_local: [[0; DMA_CHANNELS]; 2],
            dma_host: [[0; DMA_CHANNELS]; 2],
            dma_count: [[0; DMA_CHANNELS]; 2],
            dma_rdy: [[0; DMA_CHANNELS]; 2],
        }
    }

    // --- test stimulus -------------------------------------------------

    /// Latch a telegram status register value, as the MAC would.
    pub fn set_telegram_status(&mut self, port: Port, value: u32) {
        self.tgsr[port.index()] = value;
    }

    /// Latch the RXBUFTV telegram-valid register.
    pub fn set_valid_telegrams(&mut self, value: u32) {
        self.rxbuftv = value;
    }

    pub fn set_rx_new_data(&mut self, p1: bool, p2: bool) {
        self.rx_new_data = (p1, p2);
    }

    pub fn set_tsref(&mut self, value: u16) {
        self.tsref = value;
    }

    pub fn advance_tsref(&mut self) {
        self.tsref = self.tsref.wrapping_add(1);
    }

    pub fn raise_interrupt(&mut self, mask: u32) {
        self.irq |= mask;
    }

    // --- register inspection for tests ---------------------------------

    pub fn rx_base_ptr(&self, index: usize) -> u32 {
        self.rx_base_ptr[index]
    }

    pub fn tx_base_ptr(&self, index: usize) -> u32 {
        self.tx_base_ptr[index]
    }

    pub fn rx_desc_table_offset(&self) -> u16 {
        self.rx_desc_table_offset
    }

    /// Descriptor index table entry read back from Rx RAM.
    pub fn rx_desc_index(&self, telegram_slot: usize) -> u32 {
        let off = u32::from(self.rx_desc_table_offset) + (telegram_slot as u32) * 4;
        LittleEndian::read_u32(&self.rx_ram[off as usize..])
    }

    pub fn tx_desc_index(&self, telegram_slot: usize) -> u32 {
        let off = u32::from(self.tx_desc_table_offset) + (telegram_slot as u32) * 4;
        LittleEndian::read_u32(&self.tx_ram[off as usize..])
    }

    pub fn rx_descriptor(&self, desc_offset: u32) -> DescRecord {
        DescRecord::unpack(LittleEndian::read_u32(&self.rx_ram[desc_offset as usize..]))
    }

    pub fn tx_descriptor(&self, desc_offset: u32) -> DescRecord {
        DescRecord::unpack(LittleEndian::read_u32(&self.tx_ram[desc_offset as usize..]))
    }

    pub fn svc_timeouts(&self) -> (u16, u16) {
        self.svc_timeouts
    }

    pub fn svc_trigger(&self) -> (Port, usize) {
        (self.svc_trigger_port, self.svc_last_at)
    }

    pub fn dma_started(&self) -> (u16, u16) {
        (self.dma_started_rx, self.dma_started_tx)
    }
}

impl Hal for SoftFpga {
    fn usable_tx_buffer(&mut self) -> usize {
        self.usable_tx
    }

    fn usable_rx_buffers(&mut self) -> (usize, usize) {
        (self.usable_rx[0], self.usable_rx[1])
    }

    fn request_new_tx_buffer(&mut self) {
        self.tx_buffer_requests += 1;
        if self.tx_buffer_count > 1 {
            self.usable_tx = (self.usable_tx + 1) % self.tx_buffer_count;
        }
    }

    fn request_new_rx_buffer(&mut self) {
        self.rx_buffer_requests += 1;
        if self.rx_buffer_count > 1 {
            self.usable_rx[0] = (self.usable_rx[0] + 1) % self.rx_buffer_count;
            self.usable_rx[1] = (self.usable_rx[1] + 1) % self.rx_buffer_count;
        }
    }

    fn rx_buffer_valid(&mut self) -> (bool, bool) {
        self.rx_new_data
    }

    fn valid_telegrams(&mut self) -> u32 {
        self.rxbuftv
    }

    fn telegram_status(&mut self, port: Port) -> u32 {
        self.tgsr[port.index()]
    }

    fn clear_telegram_status(&mut self, port: Port, bits: u32) {
        self.tgsr[port.index()] &= !bits;
    }

    fn set_rx_desc_table_offset(&mut self, offset: u16) {
        self.rx_desc_table_offset = offset;
    }

    fn set_tx_desc_table_offset(&mut self, offset: u16) {
        self.tx_desc_table_offset = offset;
    }

    fn set_rx_descriptor(
        &mut self,
        desc_offset: u32,
        buf_offset: u16,
        buf_select: u16,
        tel_offset: u16,
        kind: RxDescType,
    ) {
        let raw = pack_descriptor(buf_offset, buf_select, tel_offset, rx_desc_code(kind));
        LittleEndian::write_u32(&mut self.rx_ram[desc_offset as usize..], raw);
    }

    fn set_tx_descriptor(
        &mut self,
        desc_offset: u32,
        buf_offset: u16,
        buf_select: u16,
        tel_offset: u16,
        kind: TxDescType,
    ) {
        let raw = pack_descriptor(buf_offset, buf_select, tel_offset, tx_desc_code(kind));
        LittleEndian::write_u32(&mut self.tx_ram[desc_offset as usize..], raw);
    }

    fn set_rx_base_ptr(&mut self, index: usize, addr: u32) {
        self.rx_base_ptr[index] = addr;
    }

    fn set_tx_base_ptr(&mut self, index: usize, addr: u32) {
        self.tx_base_ptr[index] = addr;
    }

    fn read_rx_u16(&self, offset: u32) -> u16 {
        LittleEndian::read_u16(&self.rx_ram[offset as usize..])
    }

    fn read_rx_u32(&self, offset: u32) -> u32 {
        LittleEndian::read_u32(&self.rx_ram[offset as usize..])
    }

    fn write_rx_u16(&mut self, offset: u32, value: u16) {
        LittleEndian::write_u16(&mut self.rx_ram[offset as usize..], value);
    }

    fn write_rx_u32(&mut self, offset: u32, value: u32) {
        LittleEndian::write_u32(&mut self.rx_ram[offset as usize..], value);
    }

    fn read_rx_block(&self, offset: u32, dst: &mut [u8]) {
        let start = offset as usize;
        dst.copy_from_slice(&self.rx_ram[start..start + dst.len()]);
    }

    fn read_tx_u16(&self, offset: u32) -> u16 {
        LittleEndian::read_u16(&self.tx_ram[offset as usize..])
    }

    fn write_tx_u16(&mut self, offset: u32, value: u16) {
        LittleEndian::write_u16(&mut self.tx_ram[offset as usize..], value);
    }

    fn write_tx_u32(&mut self, offset: u32, value: u32) {
        LittleEndian::write_u32(&mut self.tx_ram[offset as usize..], value);
    }

    fn write_tx_block(&mut self, offset: u32, src: &[u8]) {
        let start = offset as usize;
        self.tx_ram[start..start + src.len()].copy_from_slice(src);
    }

    fn fill_tx(&mut self, offset: u32, len: u32, value: u8) {
        let start = offset as usize;
        for byte in self.tx_ram[start..start + len as usize].iter_mut() {
            *byte = value;
        }
    }

    fn set_svc_timeouts(&mut self, busy: u16, handshake: u16) {
        self.svc_timeouts = (busy, handshake);
    }

    fn set_svc_trigger_port(&mut self, port: Port) {
        self.svc_trigger_port = port;
    }

    fn set_svc_trigger_last_at(&mut self, telegram: usize) {
        self.svc_last_at = telegram;
    }

    fn ctrl_svc_redundancy(&mut self, enable: bool) {
        self.svc_redundancy = enable;
    }

    fn tsref_counter(&self) -> u16 {
        self.tsref
    }

    fn interrupt_status(&self) -> u32 {
        self.irq
    }

    fn clear_interrupt(&mut self, mask: u32) {
        self.irq &= !mask;
    }

    fn set_dma_local_addr(&mut self, dir: DmaDirection, channel: usize, addr: u32) {
        self.dma_local[dir as usize][channel] = addr;
    }

    fn set_dma_host_addr(&mut self, dir: DmaDirection, channel: usize, addr: u32) {
        self.dma_host[dir as usize][channel] = addr;
    }

    fn set_dma_counter(&mut self, dir: DmaDirection, channel: usize, count: u32) {
        self.dma_count[dir as usize][channel] = count;
    }

    fn set_dma_rdy_addr(&mut self, dir: DmaDirection, channel: usize, addr: u32) {
        self.dma_rdy[dir as usize][channel] = addr;
    }

    fn reset_rx_dma(&mut self) {
        self.dma_started_rx = 0;
    }

    fn reset_tx_dma(&mut self) {
        self.dma_started_tx = 0;
    }

    fn start_rx_dma(&mut self, channels: u16) {
        self.dma_started_rx |= channels;
    }

    fn start_tx_dma(&mut self, channels: u16) {
        self.dma_started_tx |= channels;
    }

    fn enable_rx_dma(&mut self, channels: u16) {
        self.dma_started_rx |= channels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let mut fpga = SoftFpga::new();
        fpga.set_rx_descriptor(0x40, 0x123, 1, 0x456, RxDescType::RtdStart);
        let rec = fpga.rx_descriptor(0x40);
        assert_eq!(rec.buf_offset, 0x123);
        assert_eq!(rec.buf_select, 1);
        assert_eq!(rec.tel_offset, 0x456);
        assert_eq!(rec.type_code, 0x2);
    }

    #[test]
    fn test_ram_word_access_is_little_endian() {
        let mut fpga = SoftFpga::new();
        fpga.write_tx_u16(10, 0xABCD);
        assert_eq!(fpga.tx_ram[10], 0xCD);
        assert_eq!(fpga.tx_ram[11], 0xAB);
        assert_eq!(fpga.read_tx_u16(10), 0xABCD);
    }

    #[test]
    fn test_single_buffer_never_rotates() {
        let mut fpga = SoftFpga::new();
        fpga.request_new_rx_buffer();
        fpga.request_new_tx_buffer();
        assert_eq!(fpga.usable_tx_buffer(), 0);
        assert_eq!(fpga.usable_rx_buffers(), (0, 0));
        assert_eq!(fpga.rx_buffer_requests, 1);
    }

    #[test]
    fn test_triple_buffer_rotation() {
        let mut fpga = SoftFpga::with_buffers(3, 3);
        fpga.request_new_tx_buffer();
        assert_eq!(fpga.usable_tx_buffer(), 1);
        fpga.request_new_tx_buffer();
        fpga.request_new_tx_buffer();
        assert_eq!(fpga.usable_tx_buffer(), 0);
    }

    #[test]
    fn test_tgsr_clear_is_selective() {
        let mut fpga = SoftFpga::new();
        fpga.set_telegram_status(Port::Port1, 0x0000_1310);
        fpga.clear_telegram_status(Port::Port1, 0x0000_1200);
        assert_eq!(fpga.telegram_status(Port::Port1), 0x0000_0110);
    }
}
