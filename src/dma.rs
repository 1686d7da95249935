// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! PCI DMA operating mode: cyclic data is staged in a host-memory mirror
//! of the telegram RAM and moved by the FPGA DMA unit. The cyclic engine
//! only ever waits on the per-channel ready flags with a bounded spin.

use super::constant::{MAX_BUF, RX_RAM_SIZE, TX_RAM_SIZE};
use super::hal::{DmaDirection, Hal, DMA_CHANNELS};
use super::master::Master;
use byteorder::{ByteOrder, LittleEndian};

// upper bound for one ready-flag poll; a healthy PCI bus completes the
// transfer well within a cycle
const DMA_SPIN_LIMIT: u32 = 1_000_000;

/// DMA mirror state: host copies of both telegram RAMs, per-channel
/// ready flags and the channel start masks per buffer slot.
#[derive(Debug)]
pub(crate) struct DmaState {
    pub active: bool,
    tx_mirror: Vec<u8>,
    rx_mirror: Vec<u8>,
    tx_rdy: [u32; DMA_CHANNELS],
    rx_rdy: [u32; DMA_CHANNELS],
    /// Rx-RAM-to-host channels per Rx buffer slot, port 1 / port 2
    pub tx_start_p1: [u16; MAX_BUF],
    pub tx_start_p2: [u16; MAX_BUF],
    /// host-to-Tx-RAM channels per Tx buffer slot
    pub rx_start: [u16; MAX_BUF],
}

impl DmaState {
    pub fn new(active: bool) -> DmaState {
        DmaState {
            active,
            tx_mirror: if active {
                vec![0; TX_RAM_SIZE as usize]
            } else {
                Vec::new()
            },
            rx_mirror: if active {
                vec![0; RX_RAM_SIZE as usize]
            } else {
                Vec::new()
            },
            tx_rdy: [0; DMA_CHANNELS],
            rx_rdy: [0; DMA_CHANNELS],
            tx_start_p1: [0; MAX_BUF],
            tx_start_p2: [0; MAX_BUF],
            rx_start: [0; MAX_BUF],
        }
    }

    pub fn read_rx_u16(&self, offset: u32) -> u16 {
        LittleEndian::read_u16(&self.rx_mirror[offset as usize..])
    }

    pub fn read_rx_u32(&self, offset: u32) -> u32 {
        LittleEndian::read_u32(&self.rx_mirror[offset as usize..])
    }

    pub fn read_rx_block(&self, offset: u32, dst: &mut [u8]) {
        let start = offset as usize;
        dst.copy_from_slice(&self.rx_mirror[start..start + dst.len()]);
    }

    pub fn write_tx_u16(&mut self, offset: u32, value: u16) {
        LittleEndian::write_u16(&mut self.tx_mirror[offset as usize..], value);
    }

    pub fn write_tx_u32(&mut self, offset: u32, value: u32) {
        LittleEndian::write_u32(&mut self.tx_mirror[offset as usize..], value);
    }

    pub fn write_tx_block(&mut self, offset: u32, src: &[u8]) {
        let start = offset as usize;
        self.tx_mirror[start..start + src.len()].copy_from_slice(src);
    }

    pub fn fill_tx(&mut self, offset: u32, len: u32) {
        let start = offset as usize;
        for byte in self.tx_mirror[start..start + len as usize].iter_mut() {
            *byte = 0;
        }
    }

    pub fn is_busy_tx(&self, channels: u16) -> bool {
        (0..DMA_CHANNELS).any(|ch| channels & (1 << ch) != 0 && self.tx_rdy[ch] == 0)
    }

    pub fn is_busy_rx(&self, channels: u16) -> bool {
        (0..DMA_CHANNELS).any(|ch| channels & (1 << ch) != 0 && self.rx_rdy[ch] == 0)
    }

    pub fn clear_tx_ready(&mut self, channels: u16) {
        for ch in 0..DMA_CHANNELS {
            if channels & (1 << ch) != 0 {
                self.tx_rdy[ch] = 0;
            }
        }
    }

    pub fn clear_rx_ready(&mut self, channels: u16) {
        for ch in 0..DMA_CHANNELS {
            if channels & (1 << ch) != 0 {
                self.rx_rdy[ch] = 0;
            }
        }
    }

    fn set_tx_ready(&mut self, channels: u16) {
        for ch in 0..DMA_CHANNELS {
            if channels & (1 << ch) != 0 {
                self.tx_rdy[ch] = 1;
            }
        }
    }

    fn set_rx_ready(&mut self, channels: u16) {
        for ch in 0..DMA_CHANNELS {
            if channels & (1 << ch) != 0 {
                self.rx_rdy[ch] = 1;
            }
        }
    }
}

impl<H: Hal> Master<H> {
    /// Program the Rx-RAM-to-host channels after an Rx layout build:
    /// channel 0 moves the port 1 data buffers, channel 1 port 2.
    pub(crate) fn configure_rx_dma_channels(
        &mut self,
        base: &[u32],
        buf0_len: u32,
    ) -> Result<(), super::error::Error> {
        let p1 = base[super::hal::IDX_RX_P1_BUFF_0];
        let p2 = base[super::hal::IDX_RX_P2_BUFF_0];
        self.hal.set_dma_local_addr(DmaDirection::RxToHost, 0, p1);
        self.hal.set_dma_host_addr(DmaDirection::RxToHost, 0, p1);
        self.hal.set_dma_counter(DmaDirection::RxToHost, 0, buf0_len);
        self.hal.set_dma_rdy_addr(DmaDirection::RxToHost, 0, 0);
        self.hal.set_dma_local_addr(DmaDirection::RxToHost, 1, p2);
        self.hal.set_dma_host_addr(DmaDirection::RxToHost, 1, p2);
        self.hal.set_dma_counter(DmaDirection::RxToHost, 1, buf0_len);
        self.hal.set_dma_rdy_addr(DmaDirection::RxToHost, 1, 1);
        for buf in 0..self.state.rx_buffer_count {
            self.dma.tx_start_p1[buf] = 0x0001;
            self.dma.tx_start_p2[buf] = 0x0002;
        }
        self.hal.enable_rx_dma(0x0003);
        Ok(())
    }

    /// Program the host-to-Tx-RAM channel after a Tx layout build:
    /// channel 2 moves the whole outbound data area.
    pub(crate) fn configure_tx_dma_channels(
        &mut self,
        base: &[u32],
        _buf0_len: u32,
    ) -> Result<(), super::error::Error> {
        let start = base[super::hal::IDX_TX_BUFF_SVC];
        let len = self.state.tx_ram_in_use - start;
        self.hal.set_dma_local_addr(DmaDirection::HostToTx, 2, start);
        self.hal.set_dma_host_addr(DmaDirection::HostToTx, 2, start);
        self.hal.set_dma_counter(DmaDirection::HostToTx, 2, len);
        self.hal.set_dma_rdy_addr(DmaDirection::HostToTx, 2, 2);
        for buf in 0..self.state.tx_buffer_count {
            self.dma.rx_start[buf] = 0x0004;
        }
        Ok(())
    }

    /// Move the staged Tx mirror into the FPGA and start the channels.
    /// Called by the application after filling the cyclic data.
    pub fn dma_write_tx_ram(&mut self) {
        if !self.dma.active {
            return;
        }
        let start = 0usize;
        let end = self.state.tx_ram_in_use as usize;
        let chunk = self.dma.tx_mirror[start..end].to_vec();
        self.hal.write_tx_block(start as u32, &chunk);
        let channels = self.dma.rx_start[self.state.tx_buffer];
        self.dma.clear_rx_ready(channels);
        self.hal.start_rx_dma(channels);
        self.dma.set_rx_ready(channels);
    }

    /// Move the received FPGA Rx RAM into the host mirror and start the
    /// channels. Called by the application before `cyclic_handling` when
    /// DMA is active.
    pub fn dma_read_rx_ram(&mut self) {
        if !self.dma.active {
            return;
        }
        let end = self.state.rx_ram_in_use as usize;
        let mut chunk = vec![0u8; end];
        self.hal.read_rx_block(0, &mut chunk);
        self.dma.rx_mirror[..end].copy_from_slice(&chunk);
        let rx_buf = self.state.redundancy.rx_buffer;
        let channels = self.dma.tx_start_p1[rx_buf[0]] | self.dma.tx_start_p2[rx_buf[1]];
        self.hal.start_tx_dma(channels);
        self.dma.set_tx_ready(channels);
    }

    /// Bounded spin on the Rx-RAM-to-host ready flags. Returns false if
    /// the transfer did not complete within the spin budget.
    pub(crate) fn wait_tx_dma(&mut self, channels: u16) -> bool {
        let mut spins = 0u32;
        while self.dma.is_busy_tx(channels) {
            spins += 1;
            if spins >= DMA_SPIN_LIMIT {
                return false;
            }
        }
        true
    }

    /// Ready-flag notification hooks, driven from the DMA-end interrupt.
    pub fn dma_complete_tx(&mut self, channels: u16) {
        self.dma.set_tx_ready(channels);
    }

    pub fn dma_complete_rx(&mut self, channels: u16) {
        self.dma.set_rx_ready(channels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_flag_masks() {
        let mut dma = DmaState::new(true);
        assert!(dma.is_busy_tx(0x0003));
        dma.set_tx_ready(0x0001);
        assert!(dma.is_busy_tx(0x0003));
        dma.set_tx_ready(0x0002);
        assert!(!dma.is_busy_tx(0x0003));
        dma.clear_tx_ready(0x0002);
        assert!(dma.is_busy_tx(0x0002));
    }

    #[test]
    fn test_mirror_word_access() {
        let mut dma = DmaState::new(true);
        dma.write_tx_u16(0x100, 0x1234);
        assert_eq!(dma.tx_mirror[0x100], 0x34);
        dma.write_tx_u32(0x104, 0xAABBCCDD);
        assert_eq!(dma.tx_mirror[0x104], 0xDD);
        dma.fill_tx(0x100, 2);
        assert_eq!(dma.tx_mirror[0x100], 0);
    }
}
