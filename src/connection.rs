// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Connection state machines: the producer side of master-produced
//! connections, the consumer side of slave-produced connections with the
//! C-CON counter / new-data monitoring regime, and the public per-cycle
//! connection API.

use super::constant::*;
use super::error::Error;
use super::hal::Hal;
use super::master::{Master, SlaveProducer};

/// State of a master-produced connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProdState {
    Prepare,
    Ready,
    Producing,
    Waiting,
    Stopping,
}

/// State of a slave-produced connection consumed by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsState {
    Init,
    Prepare,
    Waiting,
    Consuming,
    Warning,
    Stopped,
    Error,
}

/// Monitoring regime of a consumer: producers that operate the C-CON
/// counter are checked against it, the rest by new-data toggling only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Counter,
    NewData,
}

/// State of either side of a configured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Producer(ProdState),
    Consumer(ConsState),
}

/// Advance a C-CON word by one production: increment the counter field
/// and toggle the new-data bit.
pub(crate) fn rotate_c_con(c_con: u16) -> u16 {
    c_con.wrapping_add(1 << C_CON_COUNTER_SHIFT) ^ C_CON_NEW_DATA
}

/// Select the monitoring regime from the first produced C-CON value.
fn set_check_mode(c_con: u16, cons: &mut SlaveProducer) {
    cons.check_mode = if c_con & C_CON_COUNTER_MASK != 0 {
        CheckMode::Counter
    } else {
        CheckMode::NewData
    };
    cons.latest_c_con = c_con;
    cons.consec_err = 0;
}

/// Escalate one missed or invalid production: the consumer goes to
/// `Warning` while within the tolerated consecutive losses, to `Error`
/// beyond them.
fn invalid_connection_data(cons: &mut SlaveProducer, allowed_losses: u16) {
    cons.consec_err += 1;
    cons.absolute_err += 1;
    cons.state = if cons.consec_err <= allowed_losses {
        ConsState::Warning
    } else {
        ConsState::Error
    };
}

/// One consumer evaluation step.
///
/// Pure function of the entry state, the monitoring type of the
/// connection and the observed C-CON; this is the transition table of the
/// consumer state machine.
pub(crate) fn consumer_step(cons: &mut SlaveProducer, monitor: u16, c_con: u16, allowed: u16) {
    let ready = c_con & C_CON_PRODUCER_READY != 0;
    let flow_control = c_con & C_CON_FLOW_CONTROL != 0;

    match cons.state {
        ConsState::Prepare | ConsState::Waiting => {
            if cons.state == ConsState::Prepare {
                if !ready {
                    return;
                }
                // PREPARE -> WAITING, fall through into the WAITING checks
                cons.state = ConsState::Waiting;
                cons.expected_c_con = C_CON_PRODUCER_READY;
                cons.absolute_err = 0;
            }
            if !ready {
                cons.state = ConsState::Prepare;
            } else if flow_control {
                cons.state = ConsState::Stopped;
            } else if c_con & (C_CON_NEW_DATA | C_CON_COUNTER_MASK) != 0 {
                cons.state = ConsState::Consuming;
                // adapt the expectation to the produced value
                cons.expected_c_con = c_con;
                set_check_mode(c_con, cons);
            }
        }

        ConsState::Consuming => match monitor {
            S_1050_SE1_SYNC => {
                if !ready {
                    invalid_connection_data(cons, allowed);
                } else if flow_control {
                    cons.state = ConsState::Stopped;
                } else if c_con == cons.latest_c_con {
                    invalid_connection_data(cons, allowed);
                } else if cons.check_mode == CheckMode::Counter {
                    if c_con >> C_CON_COUNTER_SHIFT != cons.expected_c_con >> C_CON_COUNTER_SHIFT {
                        invalid_connection_data(cons, allowed);
                    } else {
                        cons.latest_c_con = c_con;
                        cons.consec_err = 0;
                    }
                } else if c_con & C_CON_NEW_DATA != cons.expected_c_con & C_CON_NEW_DATA {
                    invalid_connection_data(cons, allowed);
                } else {
                    cons.latest_c_con = c_con;
                    cons.consec_err = 0;
                }
            }
            S_1050_SE1_ASYNC => {
                if !ready {
                    cons.state = ConsState::Warning;
                    cons.absolute_err += 1;
                } else if flow_control {
                    cons.state = ConsState::Stopped;
                } else if c_con == cons.latest_c_con {
                    cons.state = ConsState::Warning;
                    cons.absolute_err += 1;
                } else {
                    cons.latest_c_con = c_con;
                }
            }
            // watchdogged and plain-cyclic connections are not consumed
            // through this path
            _ => cons.state = ConsState::Error,
        },

        ConsState::Warning => match monitor {
            S_1050_SE1_SYNC => {
                if !ready {
                    invalid_connection_data(cons, allowed);
                } else if flow_control {
                    cons.state = ConsState::Stopped;
                } else if c_con == cons.latest_c_con {
                    invalid_connection_data(cons, allowed);
                } else if cons.check_mode == CheckMode::Counter {
                    if c_con >> C_CON_COUNTER_SHIFT != cons.expected_c_con >> C_CON_COUNTER_SHIFT {
                        invalid_connection_data(cons, allowed);
                    } else {
                        cons.state = ConsState::Consuming;
                        cons.latest_c_con = c_con;
                        cons.consec_err = 0;
                    }
                } else if c_con & C_CON_NEW_DATA != cons.expected_c_con & C_CON_NEW_DATA {
                    invalid_connection_data(cons, allowed);
                } else {
                    cons.state = ConsState::Consuming;
                    cons.latest_c_con = c_con;
                    cons.consec_err = 0;
                }
            }
            S_1050_SE1_ASYNC => {
                if !ready {
                    cons.absolute_err += 1;
                } else if flow_control {
                    cons.state = ConsState::Stopped;
                } else if c_con == cons.latest_c_con {
                    cons.absolute_err += 1;
                } else {
                    cons.state = ConsState::Consuming;
                    cons.latest_c_con = c_con;
                }
            }
            _ => cons.state = ConsState::Error,
        },

        ConsState::Stopped => {
            if ready && !flow_control {
                cons.state = ConsState::Prepare;
            }
        }

        // no cycle-driven transition; Error is left by the explicit
        // clear_connection_error call
        ConsState::Init | ConsState::Error => {}
    }
}

impl<H: Hal> Master<H> {
    /// Determine the connections produced this cycle from the TSref
    /// counter, rotate the C-CON of master-produced ones and advance the
    /// expectation of slave-produced ones.
    pub(crate) fn cyclic_connection(&mut self) {
        let tsref = (self.hal.tsref_counter() as usize) % TSREF_LIST_LENGTH;
        let tsref_mask = self.state.tsref_list[tsref];

        for slot in 0..MAX_CONN_MASTER {
            let slot = self.config.master.slots[slot];
            if !slot.is_used() {
                continue;
            }
            let conn_idx = slot.conn_idx as usize;
            let setup = self.config.configurations[slot.config_idx as usize].setup;

            if setup & S_1050_SE1_ACTIVE_TYPE_MASK == S_1050_SE1_ACTIVE_PRODUCER {
                let prod = &mut self.state.master_prod[conn_idx];
                if prod.produced & tsref_mask != 0
                    && matches!(
                        prod.state,
                        ProdState::Producing | ProdState::Waiting | ProdState::Ready
                    )
                {
                    prod.c_con = rotate_c_con(prod.c_con);
                }
                if prod.state == ProdState::Producing {
                    // ready/waiting -> producing is driven by
                    // set_connection_data, not by the cycle
                    prod.state = ProdState::Waiting;
                }
            } else if setup & S_1050_SE1_ACTIVE_TYPE_MASK == S_1050_SE1_ACTIVE_CONSUMER {
                let cons = &mut self.state.slave_prod[conn_idx];
                if cons.produced & tsref_mask != 0
                    && matches!(cons.state, ConsState::Consuming | ConsState::Warning)
                {
                    cons.expected_c_con = if cons.check_mode == CheckMode::Counter {
                        rotate_c_con(cons.expected_c_con)
                    } else {
                        cons.expected_c_con ^ C_CON_NEW_DATA
                    };
                }
            }
        }
    }

    /// Evaluate every slave-produced connection scheduled this cycle:
    /// read its C-CON from the producer's preferred port (falling back to
    /// and adopting the other port) and run the consumer state machine.
    pub(crate) fn evaluate_connections(&mut self) {
        let at_valid = self.state.redundancy.at_buf_valid;
        let rx_buf = self.state.redundancy.rx_buffer;
        let tsref = (self.hal.tsref_counter() as usize) % TSREF_LIST_LENGTH;
        let tsref_mask = self.state.tsref_list[tsref];

        for slot in 0..MAX_CONN_MASTER {
            let slot = self.config.master.slots[slot];
            if !slot.is_used() {
                continue;
            }
            let setup = self.config.configurations[slot.config_idx as usize].setup;
            if setup & S_1050_SE1_ACTIVE_TYPE_MASK != S_1050_SE1_ACTIVE_CONSUMER {
                continue;
            }
            let conn_idx = slot.conn_idx as usize;
            if self.state.slave_prod[conn_idx].produced & tsref_mask == 0 {
                continue;
            }

            let prod_idx = self.state.slave_prod[conn_idx].prod_idx as usize;
            let tel_mask = 1u32 << self.config.connections[conn_idx].tel_nbr();

            let c_con = if self.dev_status[prod_idx].miss == 0 {
                let pref = self.state.pref_port[prod_idx];
                if at_valid[pref.index()] & tel_mask != 0 {
                    let offset =
                        self.state.slave_prod[conn_idx].rx_offs[pref.index()][rx_buf[pref.index()]];
                    self.read_rx_word(offset)
                } else if at_valid[pref.other().index()] & tel_mask != 0 {
                    let other = pref.other();
                    let offset =
                        self.state.slave_prod[conn_idx].rx_offs[other.index()][rx_buf[other.index()]];
                    let value = self.read_rx_word(offset);
                    // adopt the port for anything consumed from this slave
                    self.state.pref_port[prod_idx] = other;
                    value
                } else {
                    0
                }
            } else {
                0
            };

            let allowed = self.config.connections[conn_idx].allowed_losses;
            let monitor = setup & S_1050_SE1_MONITOR_MASK;
            #[cfg(feature = "conn-trace")]
            let entry_state = self.state.slave_prod[conn_idx].state;
            consumer_step(&mut self.state.slave_prod[conn_idx], monitor, c_con, allowed);
            #[cfg(feature = "conn-trace")]
            self.trace.record(super::master::ConnTraceEntry {
                conn_idx: conn_idx as u16,
                entry_state: entry_state as u16,
                exit_state: self.state.slave_prod[conn_idx].state as u16,
                expected: self.state.slave_prod[conn_idx].expected_c_con,
                observed: c_con,
            });
        }
    }

    // --- public connection API -----------------------------------------

    /// Command the producer state of a master-produced connection.
    ///
    /// Valid commanded states are `Ready`, `Stopping` and `Prepare`.
    pub fn set_producer_state(&mut self, conn_idx: u16, commanded: ProdState) -> Result<(), Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.slave_prod[idx].produced != 0 {
            return Err(Error::ConnectionNotMasterProduced);
        }
        if self.state.master_prod[idx].produced == 0 {
            return Err(Error::ConnectionNotConfigured);
        }
        let prod = &mut self.state.master_prod[idx];
        match commanded {
            ProdState::Ready => {
                if prod.state == ProdState::Prepare || prod.state == ProdState::Stopping {
                    prod.state = ProdState::Ready;
                    prod.c_con = C_CON_PRODUCER_READY;
                }
            }
            ProdState::Stopping => {
                // the counter keeps running across a stop
                prod.state = ProdState::Stopping;
                prod.c_con |= C_CON_FLOW_CONTROL;
            }
            ProdState::Prepare => {
                prod.state = ProdState::Prepare;
                prod.c_con = 0;
            }
            _ => return Err(Error::IllegalConnectionState),
        }
        Ok(())
    }

    /// State of the configured side of a connection: the producer state
    /// for master-produced, the consumer state for slave-produced.
    pub fn get_connection_state(&self, conn_idx: u16) -> Result<ConnectionState, Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.slave_prod[idx].produced != 0 {
            Ok(ConnectionState::Consumer(self.state.slave_prod[idx].state))
        } else if self.state.master_prod[idx].produced != 0 {
            Ok(ConnectionState::Producer(self.state.master_prod[idx].state))
        } else {
            Err(Error::ConnectionNotConfigured)
        }
    }

    /// Write the payload of a master-produced connection into the
    /// current Tx buffer: the C-CON word merged with the consigned
    /// real-time bits, followed by the data.
    ///
    /// Call after `cyclic_handling` in the same cycle. Drives the
    /// producer from `Ready`/`Waiting` to `Producing`.
    pub fn set_connection_data(
        &mut self,
        conn_idx: u16,
        data: &[u8],
        rt_bits: u16,
    ) -> Result<(), Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.slave_prod[idx].produced != 0 {
            return Err(Error::ConnectionNotMasterProduced);
        }
        if self.state.master_prod[idx].produced == 0 {
            return Err(Error::ConnectionNotConfigured);
        }
        // payload length without the C-CON word
        let length = (self.config.connections[idx].length as usize).saturating_sub(2);
        if data.len() < length {
            return Err(Error::ConnectionDataInvalid);
        }
        let prod = &mut self.state.master_prod[idx];
        if prod.state == ProdState::Ready || prod.state == ProdState::Waiting {
            prod.state = ProdState::Producing;
        }
        let c_con = prod.c_con | (rt_bits & C_CON_RTB_MASK);
        let offset = prod.tx_offs[self.state.tx_buffer];
        self.write_tx_word(offset, c_con);
        self.write_tx_buffer(offset + 2, &data[..length]);
        Ok(())
    }

    /// Read the payload of a slave-produced connection (including its
    /// C-CON word) from the producer's preferred port.
    ///
    /// Call after `cyclic_handling` and `get_connection_state` for the
    /// same connection within the same cycle. Fails with
    /// `ConnectionDataInvalid` while the producer's slave valid is
    /// missing.
    pub fn get_connection_data(&self, conn_idx: u16, dest: &mut [u8]) -> Result<(), Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.master_prod[idx].produced != 0 {
            return Err(Error::ConnectionNotSlaveProduced);
        }
        if self.state.slave_prod[idx].produced == 0 {
            return Err(Error::ConnectionNotConfigured);
        }
        let cons = &self.state.slave_prod[idx];
        if self.dev_status[cons.prod_idx as usize].miss != 0 {
            return Err(Error::ConnectionDataInvalid);
        }
        let length = self.config.connections[idx].length as usize;
        if dest.len() < length {
            return Err(Error::ConnectionDataInvalid);
        }
        let port = self.state.pref_port[cons.prod_idx as usize];
        let buf = self.state.redundancy.rx_buffer[port.index()];
        let offset = cons.rx_offs[port.index()][buf];
        self.read_rx_buffer(offset, &mut dest[..length]);
        Ok(())
    }

    /// Age of the consumed connection data in producer cycles.
    pub fn get_data_delay(&self, conn_idx: u16) -> Result<u16, Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.slave_prod[idx].produced == 0 {
            return Err(Error::ConnectionNotSlaveProduced);
        }
        Ok(self.state.slave_prod[idx].consec_err)
    }

    /// Reset a consumer from `Error` back to `Prepare` and zero its
    /// error counters. A no-op in any other consumer state.
    pub fn clear_connection_error(&mut self, conn_idx: u16) -> Result<(), Error> {
        if self.phase != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let idx = conn_idx as usize;
        if self.state.slave_prod[idx].produced == 0 {
            return Err(Error::ConnectionNotSlaveProduced);
        }
        let cons = &mut self.state.slave_prod[idx];
        if cons.state == ConsState::Error {
            cons.state = ConsState::Prepare;
            cons.absolute_err = 0;
            cons.consec_err = 0;
        }
        Ok(())
    }

    #[cfg(feature = "conn-trace")]
    pub fn connection_trace(&self) -> &[super::master::ConnTraceEntry] {
        &self.trace.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::SlaveProducer;

    fn consuming(check_mode: CheckMode, latest: u16) -> SlaveProducer {
        SlaveProducer {
            produced: 1,
            state: ConsState::Consuming,
            check_mode,
            expected_c_con: latest,
            latest_c_con: latest,
            ..SlaveProducer::default()
        }
    }

    #[test]
    fn test_rotate_c_con() {
        let c0 = C_CON_PRODUCER_READY;
        let c1 = rotate_c_con(c0);
        assert_eq!(c1 >> C_CON_COUNTER_SHIFT, 1);
        assert_eq!(c1 & C_CON_NEW_DATA, C_CON_NEW_DATA);
        let c2 = rotate_c_con(c1);
        assert_eq!(c2 >> C_CON_COUNTER_SHIFT, 2);
        assert_eq!(c2 & C_CON_NEW_DATA, 0);
        // counter wraps modulo its field width
        let mut c = c0;
        for _ in 0..16 {
            c = rotate_c_con(c);
        }
        assert_eq!(c >> C_CON_COUNTER_SHIFT, 0);
        assert_eq!(c & C_CON_PRODUCER_READY, C_CON_PRODUCER_READY);
    }

    #[test]
    fn test_prepare_falls_through_to_consuming() {
        let mut cons = SlaveProducer {
            produced: 1,
            state: ConsState::Prepare,
            ..SlaveProducer::default()
        };
        // producer ready with a running counter: PREPARE -> CONSUMING in
        // one cycle
        let c_con = C_CON_PRODUCER_READY | (5 << C_CON_COUNTER_SHIFT);
        consumer_step(&mut cons, S_1050_SE1_SYNC, c_con, 1);
        assert_eq!(cons.state, ConsState::Consuming);
        assert_eq!(cons.check_mode, CheckMode::Counter);
        assert_eq!(cons.expected_c_con, c_con);
    }

    #[test]
    fn test_prepare_waits_for_producer_ready() {
        let mut cons = SlaveProducer {
            produced: 1,
            state: ConsState::Prepare,
            ..SlaveProducer::default()
        };
        consumer_step(&mut cons, S_1050_SE1_SYNC, 0, 1);
        assert_eq!(cons.state, ConsState::Prepare);
        // ready without data yet: stays WAITING
        consumer_step(&mut cons, S_1050_SE1_SYNC, C_CON_PRODUCER_READY, 1);
        assert_eq!(cons.state, ConsState::Waiting);
    }

    #[test]
    fn test_waiting_to_stopped_on_flow_control() {
        let mut cons = SlaveProducer {
            produced: 1,
            state: ConsState::Waiting,
            ..SlaveProducer::default()
        };
        consumer_step(
            &mut cons,
            S_1050_SE1_SYNC,
            C_CON_PRODUCER_READY | C_CON_FLOW_CONTROL,
            1,
        );
        assert_eq!(cons.state, ConsState::Stopped);
        // flow control released: STOPPED -> PREPARE
        consumer_step(&mut cons, S_1050_SE1_SYNC, C_CON_PRODUCER_READY, 1);
        assert_eq!(cons.state, ConsState::Prepare);
    }

    #[test]
    fn test_counter_mismatch_escalates() {
        let expected = C_CON_PRODUCER_READY | (5 << C_CON_COUNTER_SHIFT);
        let mut cons = consuming(CheckMode::Counter, expected);
        // counter jumped by two instead of one
        let observed = C_CON_PRODUCER_READY | (7 << C_CON_COUNTER_SHIFT);
        consumer_step(&mut cons, S_1050_SE1_SYNC, observed, 1);
        assert_eq!(cons.state, ConsState::Warning);
        assert_eq!(cons.consec_err, 1);
        assert_eq!(cons.absolute_err, 1);
    }

    #[test]
    fn test_counter_mismatch_with_zero_tolerance_is_error() {
        let expected = C_CON_PRODUCER_READY | (5 << C_CON_COUNTER_SHIFT);
        let mut cons = consuming(CheckMode::Counter, expected);
        let observed = C_CON_PRODUCER_READY | (7 << C_CON_COUNTER_SHIFT);
        consumer_step(&mut cons, S_1050_SE1_SYNC, observed, 0);
        assert_eq!(cons.state, ConsState::Error);
    }

    #[test]
    fn test_warning_recovers_to_consuming() {
        let expected = C_CON_PRODUCER_READY | (3 << C_CON_COUNTER_SHIFT) | C_CON_NEW_DATA;
        let mut cons = consuming(CheckMode::Counter, expected);
        cons.state = ConsState::Warning;
        cons.consec_err = 1;
        cons.latest_c_con = C_CON_PRODUCER_READY | (2 << C_CON_COUNTER_SHIFT);
        consumer_step(&mut cons, S_1050_SE1_SYNC, expected, 2);
        assert_eq!(cons.state, ConsState::Consuming);
        assert_eq!(cons.consec_err, 0);
    }

    #[test]
    fn test_async_connection_warns_without_counting_consec() {
        let latest = C_CON_PRODUCER_READY | C_CON_NEW_DATA;
        let mut cons = consuming(CheckMode::NewData, latest);
        // repeated C-CON on a non-cyclic type 2 connection
        consumer_step(&mut cons, S_1050_SE1_ASYNC, latest, 1);
        assert_eq!(cons.state, ConsState::Warning);
        assert_eq!(cons.absolute_err, 1);
        assert_eq!(cons.consec_err, 0);
        // fresh data recovers
        consumer_step(&mut cons, S_1050_SE1_ASYNC, latest ^ C_CON_NEW_DATA, 1);
        assert_eq!(cons.state, ConsState::Consuming);
    }

    #[test]
    fn test_watchdog_type_errors_out() {
        let latest = C_CON_PRODUCER_READY;
        let mut cons = consuming(CheckMode::NewData, latest);
        consumer_step(&mut cons, S_1050_SE1_ASYNC_WD, latest, 1);
        assert_eq!(cons.state, ConsState::Error);
        let mut cons = consuming(CheckMode::NewData, latest);
        consumer_step(&mut cons, S_1050_SE1_CYCLIC, latest, 1);
        assert_eq!(cons.state, ConsState::Error);
    }

    #[test]
    fn test_consumer_determinism() {
        // identical input sequences produce identical states
        let sequence = [
            C_CON_PRODUCER_READY,
            C_CON_PRODUCER_READY | C_CON_NEW_DATA | (1 << C_CON_COUNTER_SHIFT),
            C_CON_PRODUCER_READY | (2 << C_CON_COUNTER_SHIFT),
            C_CON_PRODUCER_READY | (2 << C_CON_COUNTER_SHIFT),
            0,
        ];
        let run = || {
            let mut cons = SlaveProducer {
                produced: 1,
                state: ConsState::Prepare,
                ..SlaveProducer::default()
            };
            let mut states = Vec::new();
            for &c_con in sequence.iter() {
                // mirror the cyclic expectation advance
                if matches!(cons.state, ConsState::Consuming | ConsState::Warning) {
                    cons.expected_c_con = if cons.check_mode == CheckMode::Counter {
                        rotate_c_con(cons.expected_c_con)
                    } else {
                        cons.expected_c_con ^ C_CON_NEW_DATA
                    };
                }
                consumer_step(&mut cons, S_1050_SE1_SYNC, c_con, 1);
                states.push(cons.state);
            }
            states
        };
        assert_eq!(run(), run());
    }
}
