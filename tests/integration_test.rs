// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! End-to-end scenarios: full phase bring-up against the software FPGA,
//! cyclic production and consumption, redundancy behavior and the binary
//! configuration round trip.

use byteorder::{ByteOrder, LittleEndian};
use sercos3::binconfig::{graphs_equivalent, DecodeOptions, BIN_CONFIG_VERSION_01_01, UNIVERSAL_APP_ID};
use sercos3::config::{ConfigGraph, ConnSlot, Connection, EMPTY};
use sercos3::connection::{ConnectionState, ConsState, ProdState};
use sercos3::constant::*;
use sercos3::error::{CyclicResult, Error};
use sercos3::hal::{Hal, Tgsr};
use sercos3::master::{Master, Options};
use sercos3::sim::SoftFpga;

const CYCLE_NS: u32 = 1_000_000;

fn healthy_tgsr() -> u32 {
    (Tgsr::LINK | Tgsr::MST_VALID).bits()
}

/// One master-produced MDT connection (2-byte payload behind C-CON) to
/// the slave at address 3, and one slave-produced AT connection back.
fn build_graph(graph: &mut ConfigGraph, monitor: u16, allowed_losses: u16) {
    graph.timing.cycle_time_ns = CYCLE_NS;
    graph.connections[0] = Connection {
        number: 1,
        length: 4,
        cycle_time: CYCLE_NS,
        application_id: 0x11,
        telegram_type: TelegramType::Mdt,
        ..Connection::default()
    };
    graph.connections[0].set_name("target values");
    graph.configurations[0].setup = S_1050_SE1_ACTIVE_PRODUCER;
    graph.configurations[1].setup = S_1050_SE1_ACTIVE_CONSUMER;
    graph.master.slots[0] = ConnSlot {
        conn_idx: 0,
        config_idx: 0,
        rt_bits_idx: EMPTY,
    };
    graph.slaves[0].slots[0] = ConnSlot {
        conn_idx: 0,
        config_idx: 1,
        rt_bits_idx: EMPTY,
    };

    graph.connections[1] = Connection {
        number: 2,
        length: 4,
        cycle_time: CYCLE_NS,
        allowed_losses,
        application_id: 0x11,
        telegram_type: TelegramType::At,
        ..Connection::default()
    };
    graph.connections[1].set_name("actual values");
    graph.configurations[2].setup = S_1050_SE1_ACTIVE_CONSUMER | monitor;
    graph.configurations[3].setup = S_1050_SE1_ACTIVE_PRODUCER;
    graph.master.slots[1] = ConnSlot {
        conn_idx: 1,
        config_idx: 2,
        rt_bits_idx: EMPTY,
    };
    graph.slaves[0].slots[1] = ConnSlot {
        conn_idx: 1,
        config_idx: 3,
        rt_bits_idx: EMPTY,
    };
}

struct Rig {
    master: Master<SoftFpga>,
}

impl Rig {
    fn bring_up(monitor: u16, allowed_losses: u16) -> Rig {
        let mut graph = ConfigGraph::default();
        build_graph(&mut graph, monitor, allowed_losses);
        let mut master = Master::open(SoftFpga::new(), graph, Options::default()).unwrap();
        master.project_slaves(&[3]).unwrap();
        for phase in [Phase::Cp0, Phase::Cp1, Phase::Cp2, Phase::Cp3, Phase::Cp4] {
            master.set_phase(phase).unwrap();
        }
        Rig { master }
    }

    /// make the ring healthy for the next cycle: links up, MST valid,
    /// AT0 received on both ports, slave valid set
    fn healthy(&mut self) {
        let fpga = self.master.hal_mut();
        fpga.set_telegram_status(Port::Port1, healthy_tgsr());
        fpga.set_telegram_status(Port::Port2, healthy_tgsr());
        fpga.set_valid_telegrams(0x0010 | (0x0010 << 16));
        self.write_s_dev(Port::Port1, S_DEV_SLAVE_VALID);
        self.write_s_dev(Port::Port2, S_DEV_SLAVE_VALID);
    }

    fn write_s_dev(&mut self, port: Port, value: u16) {
        let offset = self.master.s_dev_location(0, port);
        self.master.hal_mut().write_rx_u16(offset, value);
    }

    /// place a C-CON (and payload) for the slave-produced connection
    fn write_at_conn(&mut self, port: Port, c_con: u16, payload: u16) {
        let offset = self.master.consumer_location(1, port);
        self.master.hal_mut().write_rx_u16(offset, c_con);
        self.master.hal_mut().write_rx_u16(offset + 2, payload);
    }

    fn consumer_state(&self) -> ConsState {
        match self.master.get_connection_state(1).unwrap() {
            ConnectionState::Consumer(state) => state,
            other => panic!("unexpected state {:?}", other),
        }
    }

    /// C-CON word of the master-produced connection as it sits in Tx RAM
    fn produced_c_con(&self) -> u16 {
        let offset = self.master.producer_location(0);
        self.master.hal().read_tx_u16(offset)
    }
}

#[test]
fn test_producer_counter_is_monotone() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.master.set_producer_state(0, ProdState::Ready).unwrap();
    assert_eq!(
        rig.master.get_connection_state(0).unwrap(),
        ConnectionState::Producer(ProdState::Ready)
    );

    let mut last_counter = 0u16;
    let mut last_new_data = 0u16;
    for cycle in 0..8 {
        rig.healthy();
        rig.master.cyclic_handling();
        rig.master
            .set_connection_data(0, &[0xA0, cycle as u8], 0)
            .unwrap();
        assert_eq!(
            rig.master.get_connection_state(0).unwrap(),
            ConnectionState::Producer(ProdState::Producing)
        );

        let c_con = rig.produced_c_con();
        let counter = c_con >> C_CON_COUNTER_SHIFT;
        let new_data = c_con & C_CON_NEW_DATA;
        assert_eq!(counter, (cycle + 1) % 16, "cycle {}", cycle);
        assert_ne!(c_con & C_CON_PRODUCER_READY, 0);
        if cycle > 0 {
            assert_eq!((last_counter + 1) % 16, counter);
            assert_ne!(last_new_data, new_data);
        }
        last_counter = counter;
        last_new_data = new_data;
    }
}

#[test]
fn test_producer_stop_keeps_counter() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.master.set_producer_state(0, ProdState::Ready).unwrap();
    for _ in 0..3 {
        rig.healthy();
        rig.master.cyclic_handling();
        rig.master.set_connection_data(0, &[0, 0], 0).unwrap();
    }
    rig.master
        .set_producer_state(0, ProdState::Stopping)
        .unwrap();
    rig.healthy();
    rig.master.cyclic_handling();
    rig.master.set_connection_data(0, &[0, 0], 0).unwrap();
    let c_con = rig.produced_c_con();
    // flow control raised; the counter is not cleared by stopping and
    // holds its last produced value
    assert_ne!(c_con & C_CON_FLOW_CONTROL, 0);
    assert_eq!(c_con >> C_CON_COUNTER_SHIFT, 3);
}

#[test]
fn test_consumer_reaches_consuming_and_reads_data() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);

    // producer ready, no data yet
    rig.healthy();
    rig.write_at_conn(Port::Port1, C_CON_PRODUCER_READY, 0);
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Waiting);

    // first production
    let mut c_con = C_CON_PRODUCER_READY | C_CON_NEW_DATA | (1 << C_CON_COUNTER_SHIFT);
    rig.healthy();
    rig.write_at_conn(Port::Port1, c_con, 0x1234);
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Consuming);

    let mut data = [0u8; 4];
    rig.master.get_connection_data(1, &mut data).unwrap();
    assert_eq!(LittleEndian::read_u16(&data[2..]), 0x1234);
    assert_eq!(rig.master.get_data_delay(1).unwrap(), 0);

    // steady production keeps consuming
    for payload in 2..6u16 {
        c_con = (c_con.wrapping_add(1 << C_CON_COUNTER_SHIFT)) ^ C_CON_NEW_DATA;
        rig.healthy();
        rig.write_at_conn(Port::Port1, c_con, payload);
        rig.master.cyclic_handling();
        assert_eq!(rig.consumer_state(), ConsState::Consuming);
        rig.master.get_connection_data(1, &mut data).unwrap();
        assert_eq!(LittleEndian::read_u16(&data[2..]), payload);
    }
}

#[test]
fn test_consumer_counter_jump_warns_then_recovers() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.healthy();
    rig.write_at_conn(
        Port::Port1,
        C_CON_PRODUCER_READY | C_CON_NEW_DATA | (5 << C_CON_COUNTER_SHIFT),
        0,
    );
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Consuming);

    // counter jumps by two: one consecutive error, state WARNING
    rig.healthy();
    rig.write_at_conn(
        Port::Port1,
        C_CON_PRODUCER_READY | C_CON_NEW_DATA | (7 << C_CON_COUNTER_SHIFT),
        0,
    );
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Warning);
    assert_eq!(rig.master.get_data_delay(1).unwrap(), 1);
}

#[test]
fn test_consumer_zero_tolerance_goes_error_and_clears() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 0);
    rig.healthy();
    rig.write_at_conn(
        Port::Port1,
        C_CON_PRODUCER_READY | C_CON_NEW_DATA | (5 << C_CON_COUNTER_SHIFT),
        0,
    );
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Consuming);

    rig.healthy();
    rig.write_at_conn(
        Port::Port1,
        C_CON_PRODUCER_READY | C_CON_NEW_DATA | (7 << C_CON_COUNTER_SHIFT),
        0,
    );
    rig.master.cyclic_handling();
    assert_eq!(rig.consumer_state(), ConsState::Error);

    rig.master.clear_connection_error(1).unwrap();
    assert_eq!(rig.consumer_state(), ConsState::Prepare);
    assert_eq!(rig.master.get_data_delay(1).unwrap(), 0);
}

#[test]
fn test_preferred_port_switch_redirects_data() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    let c_con = C_CON_PRODUCER_READY | C_CON_NEW_DATA | (1 << C_CON_COUNTER_SHIFT);

    // port 1 carries the data first
    rig.healthy();
    rig.write_at_conn(Port::Port1, c_con, 0x1111);
    rig.write_at_conn(Port::Port2, c_con, 0x2222);
    rig.master.cyclic_handling();
    assert_eq!(rig.master.preferred_port(0), Port::Port1);
    let mut data = [0u8; 4];
    rig.master.get_connection_data(1, &mut data).unwrap();
    assert_eq!(LittleEndian::read_u16(&data[2..]), 0x1111);

    // AT0 only valid on port 2 with slave valid: the preferred port
    // switches and the data comes from port 2
    let next = (c_con.wrapping_add(1 << C_CON_COUNTER_SHIFT)) ^ C_CON_NEW_DATA;
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port1, healthy_tgsr());
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port2, healthy_tgsr());
    rig.master.hal_mut().set_valid_telegrams(0x0010 << 16);
    rig.write_s_dev(Port::Port2, S_DEV_SLAVE_VALID);
    rig.write_at_conn(Port::Port2, next, 0x4444);
    rig.master.cyclic_handling();
    assert_eq!(rig.master.preferred_port(0), Port::Port2);
    rig.master.get_connection_data(1, &mut data).unwrap();
    assert_eq!(LittleEndian::read_u16(&data[2..]), 0x4444);
}

#[test]
fn test_slave_removal_after_k_plus_one_misses() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.master.config.timing.allowed_slave_valid_miss = 2;

    for _ in 0..3 {
        rig.healthy();
        rig.master.cyclic_handling();
    }
    assert_eq!(rig.master.device_status(0).miss, 0);

    // slave valid disappears from both ports
    for expected_miss in 1..=2u16 {
        rig.master
            .hal_mut()
            .set_telegram_status(Port::Port1, healthy_tgsr());
        rig.master
            .hal_mut()
            .set_telegram_status(Port::Port2, healthy_tgsr());
        rig.write_s_dev(Port::Port1, 0);
        rig.write_s_dev(Port::Port2, 0);
        rig.master.cyclic_handling();
        assert_eq!(rig.master.device_status(0).miss, expected_miss);
        assert_eq!(rig.master.activity(0), Activity::Active);
    }
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port1, healthy_tgsr());
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port2, healthy_tgsr());
    rig.master.cyclic_handling();
    assert_eq!(rig.master.device_status(0).miss, 3);
    assert_eq!(rig.master.activity(0), Activity::Inactive);
    // the connection data of its productions is rejected now
    let mut data = [0u8; 4];
    assert_eq!(
        rig.master.get_connection_data(1, &mut data),
        Err(Error::ConnectionDataInvalid)
    );
}

#[test]
fn test_cycle_reports_no_telegrams() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port1, Tgsr::LINK.bits());
    rig.master
        .hal_mut()
        .set_telegram_status(Port::Port2, Tgsr::LINK.bits());
    rig.master.hal_mut().set_valid_telegrams(0);
    assert_eq!(
        rig.master.cyclic_handling(),
        CyclicResult::NoTelegramsReceived
    );
}

#[test]
fn test_api_phase_and_direction_guards() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    let mut data = [0u8; 4];
    // direction guards
    assert_eq!(
        rig.master.set_producer_state(1, ProdState::Ready),
        Err(Error::ConnectionNotMasterProduced)
    );
    assert_eq!(
        rig.master.get_connection_data(0, &mut data),
        Err(Error::ConnectionNotSlaveProduced)
    );
    assert_eq!(
        rig.master.set_producer_state(0, ProdState::Producing),
        Err(Error::IllegalConnectionState)
    );
    assert_eq!(
        rig.master.get_connection_state(5),
        Err(Error::ConnectionNotConfigured)
    );

    // everything is phase gated
    rig.master.set_phase(Phase::Cp3).unwrap();
    assert_eq!(
        rig.master.set_producer_state(0, ProdState::Ready),
        Err(Error::WrongPhase)
    );
    assert_eq!(rig.master.get_connection_state(0), Err(Error::WrongPhase));
    assert_eq!(
        rig.master.get_connection_data(1, &mut data),
        Err(Error::WrongPhase)
    );
}

#[test]
fn test_leaving_cp4_clears_connection_state() {
    let mut rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    rig.master.set_producer_state(0, ProdState::Ready).unwrap();
    rig.healthy();
    rig.master.cyclic_handling();

    rig.master.set_phase(Phase::Cp3).unwrap();
    rig.master.set_phase(Phase::Cp4).unwrap();
    // fresh producer state after re-entering CP4
    assert_eq!(
        rig.master.get_connection_state(0).unwrap(),
        ConnectionState::Producer(ProdState::Prepare)
    );
}

#[test]
fn test_bin_config_full_round_trip() {
    let rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    let mut buf = vec![0u8; 4096];
    rig.master
        .generate_bin_config(BIN_CONFIG_VERSION_01_01, UNIVERSAL_APP_ID, true, &mut buf)
        .unwrap();
    let len = LittleEndian::read_u16(&buf) as usize;
    assert!(len > 12 && len % 4 == 0);

    let mut fresh = Master::open(SoftFpga::new(), ConfigGraph::default(), Options::default()).unwrap();
    fresh.project_slaves(&[3]).unwrap();
    fresh
        .process_bin_config(&buf, DecodeOptions::default())
        .unwrap();
    assert!(graphs_equivalent(&rig.master.config, &fresh.config));

    // the merged configuration is complete enough to reach CP4
    fresh.config.timing.cycle_time_ns = CYCLE_NS;
    for phase in [Phase::Cp0, Phase::Cp1, Phase::Cp2, Phase::Cp3, Phase::Cp4] {
        fresh.set_phase(phase).unwrap();
    }
}

#[test]
fn test_bin_config_limited_buffer() {
    let rig = Rig::bring_up(S_1050_SE1_SYNC, 2);
    let mut buf = vec![0u8; 4096];
    LittleEndian::write_u16(&mut buf[2..], 64);
    assert_eq!(
        rig.master
            .generate_bin_config(BIN_CONFIG_VERSION_01_01, UNIVERSAL_APP_ID, true, &mut buf),
        Err(Error::BufferTooSmall)
    );
    assert_eq!(LittleEndian::read_u16(&buf), 0);
    assert!(buf[4 + 64..].iter().all(|&b| b == 0));
}
