// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Register-level seam to the Sercos FPGA (telegram RAM, descriptors,
//! multi-buffer system, telegram status, SVC trigger, DMA).

use super::constant::Port;
use bitflags::bitflags;

bitflags! {
    /// Telegram status register (TGSR) of one port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tgsr: u32 {
        const MDT0_VALID    = 0x0000_0001;
        const MDT1_VALID    = 0x0000_0002;
        const MDT2_VALID    = 0x0000_0004;
        const MDT3_VALID    = 0x0000_0008;
        const AT0_VALID     = 0x0000_0010;
        const AT1_VALID     = 0x0000_0020;
        const AT2_VALID     = 0x0000_0040;
        const AT3_VALID     = 0x0000_0080;
        const MST_VALID     = 0x0000_0100;
        const MST_MISS      = 0x0000_0200;
        const MST_DMISS     = 0x0000_0400;
        const MST_WIN_ERR   = 0x0000_0800;
        const AT0_MISS      = 0x0000_1000;
        const SEC_TEL       = 0x0000_2000; // MST carried a secondary telegram
        const LINK          = 0x0000_4000; // PHY link attached
    }
}

bitflags! {
    /// Global interrupt status / mask word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        const TINT0       = 0x0000_0001; // cycle start timer
        const TINT1       = 0x0000_0002;
        const TINT2       = 0x0000_0004;
        const TINT3       = 0x0000_0008;
        const RX_BUFREQ   = 0x0000_0010; // Rx buffer change completed
        const SVC_END     = 0x0000_0020;
        const DMA_END     = 0x0000_0040;
    }
}

// RXBUFTV, telegram-valid register: port 1 in the low half, port 2 shifted
// by 16; within a half, MDT0..3 occupy bits 0..3 and AT0..3 bits 4..7.
pub const RXBUFTV_AT_SHIFT: u32 = 4;
pub const RXBUFTV_PORT_SHIFT: u32 = 16;
pub const RXBUFTV_P1_AT_MASK: u32 = 0x0000_00F0;
pub const RXBUFTV_P2_AT_MASK: u32 = 0x00F0_0000;

// Descriptor index table: one u32 per telegram, enable bit plus the
// long-offset of the first descriptor record.
pub const DESC_INDEX_ENABLE: u32 = 0x8000_0000;
pub const DESC_INDEX_NUMBER: usize = 8; // 4 MDT + 4 AT
pub const DESC_IDX_MDT0: usize = 0;
pub const DESC_IDX_AT0: usize = 4;

/// Receive descriptor record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDescType {
    SvcStart,
    SvcEnd,
    RtdStart,
    RtdEnd,
    FcsPos,
    /// port-relative write into Tx RAM, data-field-delay variant
    PortRelDfdStart,
    PortRelDfdEnd,
    /// cross-communication, port-relative write into Tx RAM
    PortRelCcDfdStart,
    PortRelCcDfdEnd,
}

/// Transmit descriptor record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDescType {
    SvcStart,
    SvcEnd,
    RtdStart,
    RtdEnd,
    FcsPos,
    /// port-relative outbound data (HP field, sequence counters)
    PortRelStart,
    PortRelEnd,
    /// cross-communication data read from the port-relative buffer
    PortRelCcStart,
    PortRelCcEnd,
}

// Rx buffer base-pointer register indices
pub const IDX_RX_P1_BUFF_SVC: usize = 0;
pub const IDX_RX_P2_BUFF_SVC: usize = 1;
pub const IDX_RX_P1_BUFF_0: usize = 2;
pub const IDX_RX_P2_BUFF_0: usize = 3;
pub const IDX_RX_P1_BUFF_1: usize = 4;
pub const IDX_RX_P2_BUFF_1: usize = 5;
pub const IDX_RX_P1_BUFF_2: usize = 6;
pub const IDX_RX_P2_BUFF_2: usize = 7;
pub const IDX_RX_P1_PORT_WR_TX: usize = 8;
pub const IDX_RX_P2_PORT_WR_TX: usize = 9;
pub const RX_BASE_PTR_NBR: usize = 10;

// Tx buffer base-pointer register indices
pub const IDX_TX_BUFF_SVC: usize = 0;
pub const IDX_TX_BUFF_PORT_1: usize = 1;
pub const IDX_TX_BUFF_PORT_2: usize = 2;
pub const IDX_TX_BUFF_0: usize = 3;
pub const IDX_TX_BUFF_1: usize = 4;
pub const IDX_TX_BUFF_2: usize = 5;
pub const TX_BASE_PTR_NBR: usize = 6;

/// Direction selector for the DMA channel registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// FPGA Rx RAM -> host memory
    RxToHost,
    /// host memory -> FPGA Tx RAM
    HostToTx,
}

pub const DMA_CHANNELS: usize = 8;

/// Access to the Sercos controller hardware.
///
/// ## How can I implement `Hal`?
///
/// Types that are [`Hal`] map these operations onto the memory window of
/// the FPGA (register file, Rx RAM, Tx RAM, SVC RAM). All RAM offsets are
/// byte offsets from the start of the respective RAM; multi-byte accesses
/// are little-endian. [`crate::sim::SoftFpga`] is a complete software
/// implementation used by the test suite.
pub trait Hal {
    // --- multi-buffer system A -----------------------------------------

    /// Tx buffer index the processor may currently write.
    fn usable_tx_buffer(&mut self) -> usize;
    /// Rx buffer indices the processor may currently read, port 1 and 2.
    fn usable_rx_buffers(&mut self) -> (usize, usize);
    /// Hand the current Tx buffer to the MAC for the next cycle.
    fn request_new_tx_buffer(&mut self);
    /// Request a fresh Rx buffer set for the next cycle.
    fn request_new_rx_buffer(&mut self);
    /// Per-port flag: the usable Rx buffer holds newly received data.
    fn rx_buffer_valid(&mut self) -> (bool, bool);
    /// RXBUFTV register: per-port bit mask of telegrams received valid.
    fn valid_telegrams(&mut self) -> u32;

    // --- telegram status -----------------------------------------------

    fn telegram_status(&mut self, port: Port) -> u32;
    /// Clear the given self-clearing TGSR bits.
    fn clear_telegram_status(&mut self, port: Port, bits: u32);

    // --- descriptor system ---------------------------------------------

    fn set_rx_desc_table_offset(&mut self, offset: u16);
    fn set_tx_desc_table_offset(&mut self, offset: u16);
    /// Write one 4-byte Rx descriptor record at `desc_offset` in Rx RAM.
    fn set_rx_descriptor(
        &mut self,
        desc_offset: u32,
        buf_offset: u16,
        buf_select: u16,
        tel_offset: u16,
        kind: RxDescType,
    );
    /// Write one 4-byte Tx descriptor record at `desc_offset` in Tx RAM.
    fn set_tx_descriptor(
        &mut self,
        desc_offset: u32,
        buf_offset: u16,
        buf_select: u16,
        tel_offset: u16,
        kind: TxDescType,
    );
    fn set_rx_base_ptr(&mut self, index: usize, addr: u32);
    fn set_tx_base_ptr(&mut self, index: usize, addr: u32);

    // --- telegram RAM window -------------------------------------------

    fn read_rx_u16(&self, offset: u32) -> u16;
    fn read_rx_u32(&self, offset: u32) -> u32;
    fn write_rx_u16(&mut self, offset: u32, value: u16);
    fn write_rx_u32(&mut self, offset: u32, value: u32);
    fn read_rx_block(&self, offset: u32, dst: &mut [u8]);
    fn read_tx_u16(&self, offset: u32) -> u16;
    fn write_tx_u16(&mut self, offset: u32, value: u16);
    fn write_tx_u32(&mut self, offset: u32, value: u32);
    fn write_tx_block(&mut self, offset: u32, src: &[u8]);
    fn fill_tx(&mut self, offset: u32, len: u32, value: u8);

    // --- service channel machine ---------------------------------------

    fn set_svc_timeouts(&mut self, busy: u16, handshake: u16);
    fn set_svc_trigger_port(&mut self, port: Port);
    /// AT telegram whose reception triggers the SVC state machine.
    fn set_svc_trigger_last_at(&mut self, telegram: usize);
    fn ctrl_svc_redundancy(&mut self, enable: bool);

    // --- counters / interrupts -----------------------------------------

    /// Cycle-driven time-slot reference counter.
    fn tsref_counter(&self) -> u16;
    fn interrupt_status(&self) -> u32;
    fn clear_interrupt(&mut self, mask: u32);

    // --- DMA unit (absent on non-PCI hardware) -------------------------

    fn set_dma_local_addr(&mut self, _dir: DmaDirection, _channel: usize, _addr: u32) {}
    fn set_dma_host_addr(&mut self, _dir: DmaDirection, _channel: usize, _addr: u32) {}
    fn set_dma_counter(&mut self, _dir: DmaDirection, _channel: usize, _count: u32) {}
    fn set_dma_rdy_addr(&mut self, _dir: DmaDirection, _channel: usize, _addr: u32) {}
    fn reset_rx_dma(&mut self) {}
    fn reset_tx_dma(&mut self) {}
    fn start_rx_dma(&mut self, _channels: u16) {}
    fn start_tx_dma(&mut self, _channels: u16) {}
    fn enable_rx_dma(&mut self, _channels: u16) {}
}

/// AT-valid mask of one port extracted from the RXBUFTV register value.
pub fn at_valid_mask(rxbuftv: u32, port: Port) -> u32 {
    match port {
        Port::Port1 => (rxbuftv & RXBUFTV_P1_AT_MASK) >> RXBUFTV_AT_SHIFT,
        Port::Port2 => (rxbuftv & RXBUFTV_P2_AT_MASK) >> (RXBUFTV_AT_SHIFT + RXBUFTV_PORT_SHIFT),
    }
}
