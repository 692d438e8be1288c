// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::test::{complete, leak, leak_with, pattern, refused, Bench, Recorder};
    use emulator_periph::{EmulatorConfig, Faults};
    use espi_driver::config::Errata;
    use espi_driver::error::ProtocolError;
    use espi_driver::flash::maf::{MafRequest, DUMMY_READ_SIZE};
    use espi_driver::hil::{Channel, EraseSizes, Wire};
    use espi_driver::regs::{ErrMask, EspiCfg, EspiSts, FlashCtl, RegisterAccess, FLASHCTL};
    use espi_driver::request::Issued;
    use espi_driver::{EspiConfig, EspiError, Status};

    #[test]
    fn test_manual_read_matches_flash_image() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.maf().set_client(&rec);
        espi.init().unwrap();

        let issued = espi.maf().send_req(MafRequest::read(0x1000, 64), leak(64));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();
        let done = rec.take_done();
        assert_eq!(done[0].1, Ok(64));
        assert_eq!(Some(done[0].0.clone()), bench.emu.flash_image(0x1000, 64));

        // Straddles a sector boundary.
        let issued = espi.maf().send_req(MafRequest::read(0xfc0, 200), leak(200));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();
        let done = rec.take_done();
        assert_eq!(done[0].1, Ok(200));
        assert_eq!(Some(done[0].0.clone()), bench.emu.flash_image(0xfc0, 200));
        let chunks: Vec<(u64, usize)> = bench.emu.flash_requests()[1..]
            .iter()
            .map(|r| (r.address, r.length))
            .collect();
        assert_eq!(
            chunks,
            vec![(0xfc0, 64), (0x1000, 64), (0x1040, 64), (0x1080, 8)]
        );
        assert_eq!(espi.maf().get_status(), Status::Ok);
    }

    #[test]
    fn test_tags_follow_negotiated_mode() {
        for (tag2, modulus) in [(false, 16u8), (true, 2)] {
            let bench = Bench::new(EmulatorConfig {
                flash_tag2: tag2,
                ..EmulatorConfig::default()
            });
            let mut espi = bench.espi(EspiConfig::default());
            espi.init().unwrap();
            assert_eq!(espi.maf().caps().tag_modulus, modulus);

            for _ in 0..20 {
                complete(espi.maf().send_req(MafRequest::read(0, 4).polling(), leak(4)));
            }
            let tags: Vec<u8> = bench.emu.flash_requests().iter().map(|r| r.tag).collect();
            let expected: Vec<u8> = (0..20u8).map(|i| i % modulus).collect();
            assert_eq!(tags, expected);
        }
    }

    #[test]
    fn test_write_stays_within_pages() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let data = pattern(100, 0x42);
        complete(
            espi.maf()
                .send_req(MafRequest::write(0x2f0, 100).polling(), leak_with(&data)),
        );
        let chunks: Vec<(u64, usize)> = bench
            .emu
            .flash_requests()
            .iter()
            .map(|r| (r.address, r.length))
            .collect();
        assert_eq!(chunks, vec![(0x2f0, 16), (0x300, 64), (0x340, 20)]);
        assert_eq!(bench.emu.flash_image(0x2f0, 100), Some(data));
    }

    #[test]
    fn test_erase_uses_largest_blocks() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.maf().set_client(&rec);
        espi.init().unwrap();

        let issued = espi.maf().send_req(MafRequest::erase(0, 0x1_1000), leak(0));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();
        assert_eq!(rec.take_done()[0].1, Ok(0x1_1000));
        assert_eq!(
            bench.emu.flash_erases(),
            vec![(0, 0x1_0000), (0x1_0000, 0x1000)]
        );
        let lengths: Vec<usize> = bench.emu.flash_requests().iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![3, 1]);
        assert_eq!(bench.emu.flash_image(0, 0x1_1000), Some(vec![0xff; 0x1_1000]));
        assert_ne!(bench.emu.flash_image(0x1_1000, 1), Some(vec![0xff]));
    }

    #[test]
    fn test_erase_needs_a_fitting_block() {
        let bench = Bench::new(EmulatorConfig {
            erase_sizes: EraseSizes(0b010),
            ..EmulatorConfig::default()
        });
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        assert_eq!(
            refused(espi.maf().send_req(MafRequest::erase(0, 0x1000), leak(0))),
            EspiError::Unaligned
        );
        // The first 32K block fits but the 4K tail does not: nothing is erased.
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::erase(0, 0x9000).polling(), leak(0))),
            EspiError::Unaligned
        );
        assert!(bench.emu.flash_erases().is_empty());
        assert!(bench.emu.flash_requests().is_empty());
        assert_ne!(bench.emu.flash_image(0, 1), Some(vec![0xff]));

        complete(espi.maf().send_req(MafRequest::erase(0x8000, 0x8000).polling(), leak(0)));
        assert_eq!(bench.emu.flash_erases(), vec![(0x8000, 0x8000)]);

        let bench = Bench::new(EmulatorConfig {
            erase_sizes: EraseSizes(0),
            ..EmulatorConfig::default()
        });
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::erase(0, 0x1000), leak(0))),
            EspiError::InvalidType
        );
    }

    #[test]
    fn test_auto_read_through_dma() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let req = MafRequest::read(0x4000, 256).auto().with_dma().polling();
        let buf = complete(espi.maf().send_req(req, leak(256)));
        assert_eq!(Some(buf.to_vec()), bench.emu.flash_image(0x4000, 256));
        assert_eq!(bench.dma.transfers(), 1);
        assert_eq!(bench.dma.channels_in_use(), 0);

        let tags: Vec<u8> = bench.emu.flash_requests().iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![0, 1, 0, 1]);
        assert!(!bench.emu.is_set(FLASHCTL, FlashCtl::AutoEn));
    }

    #[test]
    fn test_auto_read_keeps_headers() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.maf().set_client(&rec);
        espi.init().unwrap();

        let req = MafRequest::read(0x800, 128).auto().keep_headers();
        let issued = espi.maf().send_req(req, leak(128 + 2 * 3));
        assert!(matches!(issued, Ok(Issued::Pending)));
        espi.handle_interrupt();

        let done = rec.take_done();
        assert_eq!(done[0].1, Ok(128));
        let mut expected = Vec::new();
        for t in 0..2u32 {
            expected.extend_from_slice(&[0x09, (t as u8) << 4, 0x40]);
            expected.extend(bench.emu.flash_image(0x800 + 64 * t, 64).unwrap());
        }
        assert_eq!(done[0].0, expected);
    }

    #[test]
    fn test_auto_read_alignment_erratum() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig {
            errata: Errata {
                auto_read_pow2_alignment: true,
                ..Errata::default()
            },
            ..EspiConfig::default()
        });
        espi.init().unwrap();

        assert_eq!(
            refused(espi.maf().send_req(MafRequest::read(192, 192).auto(), leak(192))),
            EspiError::Unaligned
        );
        let buf = complete(
            espi.maf()
                .send_req(MafRequest::read(256, 192).auto().polling(), leak(192)),
        );
        assert_eq!(Some(buf.to_vec()), bench.emu.flash_image(256, 192));
    }

    #[test]
    fn test_auto_read_error_raises_non_fatal() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let mask = ErrMask::TagErr::SET.value;
        bench.emu.inject(Faults {
            flash_auto_error: Some(mask),
            ..Faults::default()
        });
        let req = MafRequest::read(0, 128).auto().polling();
        assert_eq!(
            refused(espi.maf().send_req(req, leak(128))),
            EspiError::AutoModeError { mask }
        );
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
        assert_eq!(espi.maf().get_status(), Status::Failed);

        bench.emu.inject(Faults {
            flash_auto_error: Some(ErrMask::UnsucCpl::SET.value),
            ..Faults::default()
        });
        let req = MafRequest::read(0, 128).auto().polling();
        assert!(matches!(
            refused(espi.maf().send_req(req, leak(128))),
            EspiError::AutoModeError { .. }
        ));
        assert_eq!(bench.vw.asserted(Wire::NonFatalError), 1);
    }

    #[test]
    fn test_completion_with_wrong_tag() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.emu.inject(Faults {
            flash_wrong_tag: true,
            ..Faults::default()
        });
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::read(0, 16).polling(), leak(16))),
            EspiError::Protocol(ProtocolError::TagMismatch {
                expected: 0,
                got: 1
            })
        );
        assert_eq!(espi.maf().get_status(), Status::Failed);

        bench.emu.inject(Faults::default());
        let buf = complete(espi.maf().send_req(MafRequest::read(0, 16).polling(), leak(16)));
        assert_eq!(Some(buf.to_vec()), bench.emu.flash_image(0, 16));
        assert_eq!(espi.maf().get_status(), Status::Ok);
    }

    #[test]
    fn test_unsuccessful_and_stalled_completions() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig {
            busy_wait_timeout: 64,
            ..EspiConfig::default()
        });
        espi.init().unwrap();

        bench.emu.inject(Faults {
            flash_unsuccessful: true,
            ..Faults::default()
        });
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::write(0, 4).polling(), leak(4))),
            EspiError::UnsuccessfulCompletion
        );

        bench.emu.inject(Faults {
            flash_stall: true,
            ..Faults::default()
        });
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::read(0, 4).polling(), leak(4))),
            EspiError::Timeout
        );
        assert!(!bench.emu.is_set(FLASHCTL, FlashCtl::TxAvail));
    }

    #[test]
    fn test_channel_must_be_up() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        bench.vw.set_ready(Channel::Flash, false);
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::read(0, 4), leak(4))),
            EspiError::ChannelDisabled
        );
        bench.vw.set_ready(Channel::Flash, true);
        bench.emu.configure(EspiCfg::FlashEn::CLEAR);
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::read(0, 4), leak(4))),
            EspiError::ChannelDisabled
        );
        assert_eq!(
            refused(espi.maf().send_req(MafRequest::write(0, 4).with_dma(), leak(4))),
            EspiError::InvalidType
        );
        assert!(bench.emu.flash_requests().is_empty());
    }

    #[test]
    fn test_dummy_read_after_reset_in_auto_mode() {
        let bench = Bench::default();
        let rec = Recorder::default();
        let mut espi = bench.espi(EspiConfig {
            errata: Errata {
                dummy_read_after_reset: true,
                ..Errata::default()
            },
            ..EspiConfig::default()
        });
        espi.maf().set_client(&rec);
        espi.init().unwrap();

        let issued = espi
            .maf()
            .send_req(MafRequest::read(0x4000, 256).auto(), leak(256));
        assert!(matches!(issued, Ok(Issued::Pending)));
        bench.emu.raise(EspiSts::EspiRst::SET);
        espi.handle_interrupt();

        assert_eq!(rec.take_done()[0].1, Err(EspiError::Aborted));
        assert!(espi.maf().dummy_read_pending());

        let buf = complete(
            espi.maf()
                .send_req(MafRequest::read(0x2000, 32).polling(), leak(32)),
        );
        assert_eq!(Some(buf.to_vec()), bench.emu.flash_image(0x2000, 32));
        assert!(!espi.maf().dummy_read_pending());

        let log = bench.emu.flash_requests();
        let tail: Vec<(u8, u64, usize)> = log[log.len() - 2..]
            .iter()
            .map(|r| (r.tag, r.address, r.length))
            .collect();
        assert_eq!(tail, vec![(0, 0, DUMMY_READ_SIZE), (1, 0x2000, 32)]);
    }

    #[test]
    fn test_no_dummy_read_without_erratum() {
        let bench = Bench::default();
        let mut espi = bench.espi(EspiConfig::default());
        espi.init().unwrap();

        let issued = espi
            .maf()
            .send_req(MafRequest::read(0x4000, 128).auto(), leak(128));
        assert!(matches!(issued, Ok(Issued::Pending)));
        bench.emu.raise(EspiSts::EspiRst::SET);
        espi.handle_interrupt();
        assert!(!espi.maf().dummy_read_pending());

        complete(espi.maf().send_req(MafRequest::read(0x2000, 8).polling(), leak(8)));
        let log = bench.emu.flash_requests();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].address, 0x2000);
    }
}
