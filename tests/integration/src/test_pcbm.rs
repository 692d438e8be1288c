// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::test::{complete, leak, leak_with, pattern, refused, Bench, Recorder};
    use emulator_periph::{BurstFault, Faults};
    use espi_driver::hil::{Channel, Wire};
    use espi_driver::packet::{CycleType, LtrMessage};
    use espi_driver::pcbm::PcBmRequest;
    use espi_driver::regs::{BmCtl, ErrMask, EspiSts, RegisterAccess, BMCTL};
    use espi_driver::request::Issued;
    use espi_driver::{EspiConfig, EspiError, Status};

    #[test]
    fn test_manual_read_from_host_memory() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.pcbm().set_client(&rec);
        espi.init().unwrap();

        let issued = espi.pcbm().send_req(PcBmRequest::read(0x1000, 64), leak(64));
        assert!(matches!(issued, Ok(Issued::Pending)));
        assert_eq!(espi.pcbm().get_status(), Status::Busy);
        espi.handle_interrupt();

        let done = rec.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, Ok(64));
        assert_eq!(done[0].0, bench.emu.host_read(0x1000, 64));
        assert_eq!(espi.pcbm().get_status(), Status::Ok);
        assert!(!bench.emu.irq_pending());
    }

    #[test]
    fn test_write_chunks_stop_at_4k() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.pcbm().set_client(&rec);
        espi.init().unwrap();

        let data = pattern(200, 0x5a);
        let issued = espi
            .pcbm()
            .send_req(PcBmRequest::write(0xfe0, 200), leak_with(&data));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();

        assert_eq!(rec.take_done()[0].1, Ok(200));
        let log = bench.emu.bm_requests();
        let chunks: Vec<(u64, usize)> = log.iter().map(|r| (r.address, r.length)).collect();
        assert_eq!(
            chunks,
            vec![(0xfe0, 32), (0x1000, 64), (0x1040, 64), (0x1080, 40)]
        );
        let tags: Vec<u8> = log.iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert_eq!(bench.emu.host_read(0xfe0, 200), data);
    }

    #[test]
    fn test_tags_cycle_through_sixteen() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        for _ in 0..20 {
            complete(espi.pcbm().send_req(PcBmRequest::read(0x100, 1).polling(), leak(1)));
        }
        let tags: Vec<u8> = bench.emu.bm_requests().iter().map(|r| r.tag).collect();
        let expected: Vec<u8> = (0..20u8).map(|i| i % 16).collect();
        assert_eq!(tags, expected);
        assert_eq!(espi.pcbm().current_tag(), 4);
    }

    #[test]
    fn test_64bit_address_reaches_the_wire() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let addr = 0x1_2345_6780;
        let buf = complete(espi.pcbm().send_req(PcBmRequest::read(addr, 16).polling(), leak(16)));
        assert_eq!(buf.to_vec(), bench.emu.host_read(addr, 16));

        let log = bench.emu.bm_requests();
        assert_eq!(log[0].cycle, u8::from(CycleType::MemRead64));
        assert_eq!(log[0].address, addr);

        complete(espi.pcbm().send_req(PcBmRequest::write(addr, 8).polling(), leak_with(&[0xa5; 8])));
        let log = bench.emu.bm_requests();
        assert_eq!(log[1].cycle, u8::from(CycleType::MemWrite64));
        assert_eq!(bench.emu.host_read(addr, 8), vec![0xa5; 8]);
    }

    #[test]
    fn test_auto_read_keeps_headers() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let req = PcBmRequest::read(0x8000, 256).auto().keep_headers().polling();
        let buf = complete(espi.pcbm().send_req(req, leak(256 + 4 * 3)));

        let mut expected = Vec::new();
        for t in 0..4u64 {
            expected.extend_from_slice(&[0x09, (t as u8) << 4, 0x40]);
            expected.extend(bench.emu.host_read(0x8000 + 64 * t, 64));
        }
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(espi.pcbm().current_tag(), 4);
        assert!(!bench.emu.is_set(BMCTL, BmCtl::AutoEn));
    }

    #[test]
    fn test_burst_error_reports_transaction() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.pcbm().set_client(&rec);
        espi.init().unwrap();

        let mask = ErrMask::Malformed::SET.value;
        bench.emu.inject(Faults {
            bm_burst_error: Some(BurstFault {
                transaction: 3,
                mask,
            }),
            ..Faults::default()
        });
        let req = PcBmRequest::read(0x8000, 256).auto().keep_headers();
        let issued = espi.pcbm().send_req(req, leak(256 + 4 * 3));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();

        let done = rec.take_done();
        assert_eq!(
            done[0].1,
            Err(EspiError::BurstError {
                transaction: 3,
                mask
            })
        );
        assert_eq!(espi.pcbm().get_status(), Status::Failed);
        assert!(!bench.emu.is_set(BMCTL, BmCtl::AutoEn));
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
        assert_eq!(bench.vw.level(Wire::NonFatalError), Some(true));
        assert!(espi.pcbm().error_wire_asserted());

        // The next request the channel takes drops the wire again.
        bench.emu.inject(Faults::default());
        complete(espi.pcbm().send_req(PcBmRequest::read(0x8000, 64).polling(), leak(64)));
        assert_eq!(bench.vw.level(Wire::NonFatalError), Some(false));
        assert!(!espi.pcbm().error_wire_asserted());
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
    }

    #[test]
    fn test_unsuccessful_burst_raises_no_wire() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.emu.inject(Faults {
            bm_burst_error: Some(BurstFault {
                transaction: 0,
                mask: ErrMask::UnsucCpl::SET.value,
            }),
            ..Faults::default()
        });
        let req = PcBmRequest::read(0, 128).auto().polling();
        let err = refused(espi.pcbm().send_req(req, leak(128)));
        assert_eq!(err, EspiError::BurstError { transaction: 0, mask: 1 });
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 0);
    }

    #[test]
    fn test_auto_write_through_fifo() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let data = pattern(128, 0x33);
        complete(
            espi.pcbm()
                .send_req(PcBmRequest::write(0x3000, 128).auto().polling(), leak_with(&data)),
        );
        assert_eq!(bench.emu.host_read(0x3000, 128), data);
        let tags: Vec<u8> = bench.emu.bm_requests().iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![0, 1]);
    }

    #[test]
    fn test_dma_bursts_release_channels() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let req = PcBmRequest::read(0x6000, 256).auto().with_dma().polling();
        let buf = complete(espi.pcbm().send_req(req, leak(256)));
        assert_eq!(buf.to_vec(), bench.emu.host_read(0x6000, 256));
        assert_eq!(bench.dma.transfers(), 1);
        assert_eq!(bench.dma.channels_in_use(), 0);

        let data = pattern(128, 0x77);
        let req = PcBmRequest::write(0x7000, 128).auto().with_dma().polling();
        complete(espi.pcbm().send_req(req, leak_with(&data)));
        assert_eq!(bench.emu.host_read(0x7000, 128), data);
        assert_eq!(bench.dma.transfers(), 2);
        assert_eq!(bench.dma.channels_in_use(), 0);

        // One transaction is not worth a DMA channel.
        let data = pattern(64, 0x11);
        let req = PcBmRequest::write(0x7100, 64).auto().with_dma().polling();
        complete(espi.pcbm().send_req(req, leak_with(&data)));
        assert_eq!(bench.emu.host_read(0x7100, 64), data);
        assert_eq!(bench.dma.transfers(), 2);
    }

    #[test]
    fn test_failed_dma_fails_the_burst() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.dma.fail_transfers(true);
        let req = PcBmRequest::read(0x6000, 128).auto().with_dma().polling();
        assert!(matches!(
            refused(espi.pcbm().send_req(req, leak(128))),
            EspiError::Dma(_)
        ));
        assert_eq!(bench.dma.channels_in_use(), 0);
        assert_eq!(espi.pcbm().get_status(), Status::Failed);
    }

    #[test]
    fn test_requests_rejected_before_the_wire() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let cases = [
            (PcBmRequest::read(0, 64).with_dma(), 64, EspiError::InvalidType),
            (PcBmRequest::read(0, 100).auto(), 128, EspiError::InvalidSize),
            (PcBmRequest::read(0x20, 128).auto(), 128, EspiError::Unaligned),
            (PcBmRequest::read(0, 64 * 65).auto(), 64 * 65, EspiError::InvalidSize),
            (PcBmRequest::read(0, 64), 32, EspiError::BufferTooSmall),
        ];
        for (req, len, expected) in cases {
            assert_eq!(refused(espi.pcbm().send_req(req, leak(len))), expected);
        }

        bench.vw.set_ready(Channel::BusMaster, false);
        assert_eq!(
            refused(espi.pcbm().send_req(PcBmRequest::read(0, 4), leak(4))),
            EspiError::ChannelDisabled
        );
        assert!(bench.emu.bm_requests().is_empty());
    }

    #[test]
    fn test_stalled_master_times_out() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig {
            busy_wait_timeout: 64,
            ..EspiConfig::default()
        });
        espi.init().unwrap();

        bench.emu.inject(Faults {
            bm_stall: true,
            ..Faults::default()
        });
        let err = refused(espi.pcbm().send_req(PcBmRequest::read(0x40, 8).polling(), leak(8)));
        assert_eq!(err, EspiError::Timeout);
        assert_eq!(espi.pcbm().get_status(), Status::Failed);
        assert!(!bench.emu.is_set(BMCTL, BmCtl::TxAvail));

        bench.emu.inject(Faults::default());
        let buf = complete(espi.pcbm().send_req(PcBmRequest::read(0x40, 8).polling(), leak(8)));
        assert_eq!(buf.to_vec(), bench.emu.host_read(0x40, 8));
        assert_eq!(espi.pcbm().get_status(), Status::Ok);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.emu.inject(Faults {
            bm_stall: true,
            ..Faults::default()
        });
        let issued = espi.pcbm().send_req(PcBmRequest::read(0, 16), leak(16));
        assert!(matches!(issued, Ok(Issued::Pending)));
        assert_eq!(
            refused(espi.pcbm().send_req(PcBmRequest::read(0, 16), leak(16))),
            EspiError::Busy
        );

        assert!(espi.pcbm().abort().is_some());
        let once = (bench.emu.get_raw(BMCTL), espi.pcbm().get_status());
        assert!(espi.pcbm().abort().is_none());
        assert_eq!(once, (bench.emu.get_raw(BMCTL), espi.pcbm().get_status()));
        assert_eq!(once.1, Status::Failed);
    }

    #[test]
    fn test_reset_aborts_in_flight_request() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.pcbm().set_client(&rec);
        espi.set_client(&rec);
        espi.init().unwrap();

        bench.emu.inject(Faults {
            bm_stall: true,
            ..Faults::default()
        });
        let issued = espi.pcbm().send_req(PcBmRequest::write(0, 16), leak(16));
        assert!(matches!(issued, Ok(Issued::Pending)));

        bench.emu.raise(EspiSts::EspiRst::SET);
        espi.handle_interrupt();

        let done = rec.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, Err(EspiError::Aborted));
        assert_eq!(
            *rec.events.borrow(),
            vec![espi_driver::hil::EspiEvent::EspiReset]
        );
        assert_eq!(espi.pcbm().get_status(), Status::Failed);
    }

    #[test]
    fn test_ltr_message_reaches_master() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let ltr = LtrMessage::new(true, 2, 0x155);
        complete(espi.pcbm().send_req(PcBmRequest::ltr(ltr).polling(), leak(0)));
        assert_eq!(bench.emu.ltr_messages(), vec![ltr.bits()]);
        assert_eq!(
            bench.emu.bm_requests()[0].cycle,
            u8::from(CycleType::Message)
        );

        // Messages never carry data.
        let mut msg = PcBmRequest::ltr(ltr);
        msg.size = 4;
        assert_eq!(
            refused(espi.pcbm().send_req(msg, leak(4))),
            EspiError::InvalidSize
        );
    }
}
