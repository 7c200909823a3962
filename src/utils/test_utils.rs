//! Test fixtures for assembling and loading programs.
